use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};

/// Reads class labels in model output order, one per line.
///
/// Lines may carry trailing comma-separated fields (e.g. display colors);
/// only the first field is kept. The line number is the class index, so a
/// blank line is only accepted at the end of the file.
pub fn load_class_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut labels = Vec::new();
    let mut first_blank = None;

    for (line_number, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        let label = line.split(',').next().unwrap_or_default().trim();
        if label.is_empty() {
            first_blank.get_or_insert(line_number + 1);
            continue;
        }
        if let Some(blank) = first_blank {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Blank label on line {} of {:?}", blank, filepath),
            ));
        }
        labels.push(label.to_string());
    }

    if labels.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("No labels found in {:?}", filepath),
        ));
    }

    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_class_labels() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "person").unwrap();
        writeln!(file, "bicycle, 255, 0, 0").unwrap();
        writeln!(file, "  cat  ").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "   ").unwrap();

        let labels = load_class_labels(file.path()).unwrap();
        assert_eq!(labels, vec!["person", "bicycle", "cat"]);
    }

    #[test]
    fn test_load_class_labels_rejects_interior_blank_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "person").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "cat").unwrap();

        let err = load_class_labels(file.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_load_class_labels_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = load_class_labels(file.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_load_class_labels_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_class_labels(&dir.path().join("missing.txt")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
