//! Command list import from tabular text or spreadsheet files.

use calamine::{Reader, Xlsx};
use std::io::Cursor;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Unable to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid spreadsheet: {0}")]
    Spreadsheet(String),

    #[error("No commands found")]
    NoCommands,

    #[error("Cannot import while a run is active")]
    RunActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFormat {
    Csv,
    Xlsx,
}

impl CommandFormat {
    /// `.csv` files are tabular text; everything else is read as a spreadsheet.
    pub fn from_file_name(name: &str) -> Self {
        if name.to_lowercase().ends_with(".csv") {
            CommandFormat::Csv
        } else {
            CommandFormat::Xlsx
        }
    }
}

fn is_header(cell: &str) -> bool {
    cell.to_lowercase().contains("command")
}

/// Parse commands from `bytes`, trimmed and non-blank, in file order.
pub fn parse_commands(bytes: &[u8], format: CommandFormat) -> Result<Vec<String>, ImportError> {
    match format {
        CommandFormat::Csv => parse_csv(bytes),
        CommandFormat::Xlsx => parse_xlsx(bytes),
    }
}

fn parse_csv(bytes: &[u8]) -> Result<Vec<String>, ImportError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let mut commands = Vec::new();
    for record in reader.records() {
        let record = record?;
        let first = record.get(0).unwrap_or_default().trim();
        if first.is_empty() {
            continue;
        }
        let first_line = record.position().is_some_and(|p| p.line() == 1);
        if first_line && is_header(first) {
            continue;
        }
        commands.push(first.to_string());
    }
    Ok(commands)
}

fn parse_xlsx(bytes: &[u8]) -> Result<Vec<String>, ImportError> {
    let mut workbook: Xlsx<_> =
        Xlsx::new(Cursor::new(bytes)).map_err(|e| ImportError::Spreadsheet(e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ImportError::Spreadsheet("workbook has no sheets".into()))?
        .map_err(|e| ImportError::Spreadsheet(e.to_string()))?;

    let (Some((first_row, _)), Some((last_row, _))) = (range.start(), range.end()) else {
        return Ok(Vec::new());
    };

    let mut commands = Vec::new();
    for row in first_row..=last_row {
        let Some(cell) = range.get_value((row, 0)) else {
            continue;
        };
        let value = cell.to_string();
        let value = value.trim();
        // The header sits on the first populated row, wherever the sheet starts.
        if value.is_empty() || (row == first_row && is_header(value)) {
            continue;
        }
        commands.push(value.to_string());
    }
    Ok(commands)
}

/// Read and parse a command file, choosing the format from its name.
pub async fn load_commands(path: &Path) -> Result<Vec<String>, ImportError> {
    let bytes = tokio::fs::read(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let commands = parse_commands(&bytes, CommandFormat::from_file_name(&name))?;
    if commands.is_empty() {
        return Err(ImportError::NoCommands);
    }
    tracing::debug!(file = %name, count = commands.len(), "commands imported");
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn format_follows_suffix() {
        assert_eq!(CommandFormat::from_file_name("list.csv"), CommandFormat::Csv);
        assert_eq!(CommandFormat::from_file_name("LIST.CSV"), CommandFormat::Csv);
        assert_eq!(CommandFormat::from_file_name("list.xlsx"), CommandFormat::Xlsx);
        assert_eq!(CommandFormat::from_file_name("commands"), CommandFormat::Xlsx);
    }

    #[test]
    fn csv_skips_header_and_blank_lines() {
        let csv = "command\nTurn on lights\n\n   \nPlay music\n";
        let commands = parse_commands(csv.as_bytes(), CommandFormat::Csv).unwrap();
        assert_eq!(commands, vec!["Turn on lights", "Play music"]);
    }

    #[test]
    fn csv_header_match_is_case_insensitive() {
        let csv = "Voice Commands,Expected\nWhat time is it,time\n";
        let commands = parse_commands(csv.as_bytes(), CommandFormat::Csv).unwrap();
        assert_eq!(commands, vec!["What time is it"]);
    }

    #[test]
    fn csv_header_only_skipped_on_first_line() {
        let csv = "Set a timer\nCommand the robot\n";
        let commands = parse_commands(csv.as_bytes(), CommandFormat::Csv).unwrap();
        assert_eq!(commands, vec!["Set a timer", "Command the robot"]);
    }

    #[test]
    fn csv_uses_first_field_and_honours_quotes() {
        let csv = "\"Call mom, then dad\",extra\n  Volume up  ,5\n";
        let commands = parse_commands(csv.as_bytes(), CommandFormat::Csv).unwrap();
        assert_eq!(commands, vec!["Call mom, then dad", "Volume up"]);
    }

    #[test]
    fn garbage_spreadsheet_is_rejected() {
        let result = parse_commands(b"not a zip archive", CommandFormat::Xlsx);
        assert!(matches!(result, Err(ImportError::Spreadsheet(_))));
    }

    fn fixture(name: &str) -> Vec<u8> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name);
        std::fs::read(&path).expect("Failed to read fixture")
    }

    #[test]
    fn spreadsheet_reads_column_a_skipping_header_and_blanks() {
        let commands =
            parse_commands(&fixture("commands.xlsx"), CommandFormat::Xlsx).unwrap();
        assert_eq!(commands, vec!["Turn on the lights", "Play some jazz"]);
    }

    #[test]
    fn spreadsheet_header_below_an_empty_first_row_is_skipped() {
        let commands = parse_commands(
            &fixture("header_after_blank_row.xlsx"),
            CommandFormat::Xlsx,
        )
        .unwrap();
        assert_eq!(commands, vec!["Turn off TV", "Volume up"]);
    }

    #[tokio::test]
    async fn load_reads_spreadsheet_from_disk() {
        let dir = tempdir().expect("Failed to create temp dir");
        let file_path = dir.path().join("commands.xlsx");
        std::fs::write(&file_path, fixture("commands.xlsx")).expect("Failed to write");

        let commands = load_commands(&file_path).await.expect("Failed to load");
        assert_eq!(commands.len(), 2);
    }

    #[tokio::test]
    async fn load_reads_file_from_disk() {
        let dir = tempdir().expect("Failed to create temp dir");
        let file_path = dir.path().join("commands.csv");
        let mut file = std::fs::File::create(&file_path).expect("Failed to create file");
        file.write_all(b"Commands\nOne\nTwo\n").expect("Failed to write");
        drop(file);

        let commands = load_commands(&file_path).await.expect("Failed to load");
        assert_eq!(commands, vec!["One", "Two"]);
    }

    #[tokio::test]
    async fn load_rejects_empty_list() {
        let dir = tempdir().expect("Failed to create temp dir");
        let file_path = dir.path().join("empty.csv");
        std::fs::write(&file_path, "command\n\n").expect("Failed to write");

        let err = load_commands(&file_path).await.unwrap_err();
        assert!(matches!(err, ImportError::NoCommands));
        assert_eq!(err.to_string(), "No commands found");
    }

    #[tokio::test]
    async fn load_reports_missing_file() {
        let dir = tempdir().expect("Failed to create temp dir");
        let err = load_commands(&dir.path().join("missing.csv"))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Io(_)));
    }
}
