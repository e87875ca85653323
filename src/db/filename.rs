//! Naming scheme for the files a database directory contains.

use std::path::MAIN_SEPARATOR;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// `*.log`: write-ahead log.
    Log,
    /// `LOCK`: the advisory lock guarding the whole database.
    Lock,
    /// `*.ldb`: sorted table.
    Table,
    /// `*.sst`: sorted table written by older releases.
    OldTable,
    /// `MANIFEST-*`: version-edit descriptor, framed like a log file.
    Manifest,
    /// `CURRENT`: names the manifest in use.
    Current,
    /// `*.dbtmp`: scratch file that is renamed into place.
    Temp,
    /// `LOG`: info log.
    InfoLog,
}

/// Builds the full path of the database file `file_type`/`seq` under
/// `db_name`.
pub fn generate_filename(db_name: &str, file_type: FileType, seq: u64) -> String {
    match file_type {
        FileType::Log => format!("{}{}{:06}.log", db_name, MAIN_SEPARATOR, seq),
        FileType::Lock => format!("{}{}LOCK", db_name, MAIN_SEPARATOR),
        FileType::Table => format!("{}{}{:06}.ldb", db_name, MAIN_SEPARATOR, seq),
        FileType::OldTable => format!("{}{}{:06}.sst", db_name, MAIN_SEPARATOR, seq),
        FileType::Manifest => format!("{}{}MANIFEST-{:06}", db_name, MAIN_SEPARATOR, seq),
        FileType::Current => format!("{}{}CURRENT", db_name, MAIN_SEPARATOR),
        FileType::Temp => format!("{}{}{:06}.dbtmp", db_name, MAIN_SEPARATOR, seq),
        FileType::InfoLog => format!("{}{}LOG", db_name, MAIN_SEPARATOR),
    }
}

/// Recognizes the basename of a database file. Returns the type and the
/// file number (zero for the singleton files), or `None` for foreign
/// files that recovery must leave alone.
pub fn parse_filename(basename: &str) -> Option<(FileType, u64)> {
    match basename {
        "CURRENT" => return Some((FileType::Current, 0)),
        "LOCK" => return Some((FileType::Lock, 0)),
        "LOG" | "LOG.old" => return Some((FileType::InfoLog, 0)),
        _ => {}
    }
    if let Some(rest) = basename.strip_prefix("MANIFEST-") {
        let seq = rest.parse::<u64>().ok()?;
        return Some((FileType::Manifest, seq));
    }
    let dot = basename.find('.')?;
    let seq = basename[..dot].parse::<u64>().ok()?;
    match &basename[dot..] {
        ".log" => Some((FileType::Log, seq)),
        ".ldb" => Some((FileType::Table, seq)),
        ".sst" => Some((FileType::OldTable, seq)),
        ".dbtmp" => Some((FileType::Temp, seq)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate() {
        let sep = MAIN_SEPARATOR;
        assert_eq!(
            generate_filename("db", FileType::Log, 100),
            format!("db{}000100.log", sep)
        );
        assert_eq!(
            generate_filename("db", FileType::Table, 5),
            format!("db{}000005.ldb", sep)
        );
        assert_eq!(
            generate_filename("db", FileType::OldTable, 5),
            format!("db{}000005.sst", sep)
        );
        assert_eq!(
            generate_filename("db", FileType::Manifest, 7),
            format!("db{}MANIFEST-000007", sep)
        );
        assert_eq!(
            generate_filename("db", FileType::Current, 0),
            format!("db{}CURRENT", sep)
        );
        assert_eq!(
            generate_filename("db", FileType::Lock, 0),
            format!("db{}LOCK", sep)
        );
    }

    #[test]
    fn test_parse_round_trip() {
        for (t, seq) in [
            (FileType::Log, 42u64),
            (FileType::Table, 1),
            (FileType::OldTable, 999_999),
            (FileType::Manifest, 3),
            (FileType::Temp, 17),
        ] {
            let name = generate_filename("dir", t, seq);
            let basename = name.rsplit(MAIN_SEPARATOR).next().unwrap();
            assert_eq!(parse_filename(basename), Some((t, seq)));
        }
        assert_eq!(parse_filename("CURRENT"), Some((FileType::Current, 0)));
        assert_eq!(parse_filename("LOCK"), Some((FileType::Lock, 0)));
        assert_eq!(parse_filename("LOG"), Some((FileType::InfoLog, 0)));
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        for name in [
            "",
            "foo",
            "foo-dx-100.log",
            ".log",
            "100",
            "100.",
            "100.lop",
            "MANIFEST",
            "MANIFEST-",
            "MANIFEST-abc",
            "18446744073709551616.log",
        ] {
            assert_eq!(parse_filename(name), None, "{:?}", name);
        }
    }
}
