use std::collections::BTreeMap;

pub type SeedFields = BTreeMap<String, String>;

/// Extracts seed fields from a file name. Seeds override model output of
/// the same name. Never fails: unrecognized names give an empty map.
pub trait FilenameParser: Send + Sync {
    fn parse(&self, filename: &str) -> SeedFields;

    /// Every field `parse` may return.
    fn provided_fields(&self) -> &[&'static str];
}

/// For families whose file names carry nothing useful.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSeeds;

impl FilenameParser for NoSeeds {
    fn parse(&self, _filename: &str) -> SeedFields {
        SeedFields::new()
    }

    fn provided_fields(&self) -> &[&'static str] {
        &[]
    }
}

/// File name without directory or final extension.
pub fn file_stem(filename: &str) -> &str {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    match name.rfind('.') {
        Some(0) | None => name,
        Some(dot) => &name[..dot],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_seeds() {
        assert!(NoSeeds.parse("anything.pdf").is_empty());
        assert!(NoSeeds.provided_fields().is_empty());
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("dir/report_v1.2.pdf"), "report_v1.2");
        assert_eq!(file_stem("C:\\docs\\a.txt"), "a");
        assert_eq!(file_stem(".hidden"), ".hidden");
        assert_eq!(file_stem("plain"), "plain");
    }
}
