use crate::core::{CheckStyle, MessageRecord, Result, SignalError, parse_timestamp};
use tracing::{Level, event};

const MIN_FIELDS: usize = 4;

/// Decodes one received line:
/// `timestamp \t clientName \t status \t message [\t parameter [\t checkStyle]]`.
///
/// Columns past the sixth are ignored. An unknown check style is stored as
/// `Recurring` so only an explicit `Once` is ever finalized. Either a
/// complete record or a `DecodeError`; nothing in between.
pub fn decode_line(line: &str) -> Result<MessageRecord> {
    let line = line.trim_end_matches(['\r', '\n']);
    let fields: Vec<&str> = line.split('\t').collect();

    if fields.len() < MIN_FIELDS {
        return Err(SignalError::DecodeError(format!(
            "expected at least {} fields, got {}",
            MIN_FIELDS,
            fields.len()
        )));
    }

    let connect_time = parse_timestamp(fields[0])?;
    let parameter = fields.get(4).copied().unwrap_or_default();
    let check_style = match fields.get(5) {
        Some(text) if !text.trim().is_empty() => text.parse::<CheckStyle>().unwrap_or_else(|err| {
            event!(Level::WARN, client = fields[1], error = %err, "treating check style as recurring");
            CheckStyle::Recurring
        }),
        _ => CheckStyle::Once,
    };

    Ok(
        MessageRecord::new(connect_time, fields[1], fields[2], fields[3])
            .with_parameter(parameter)
            .with_check_style(check_style),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_line() {
        let record =
            decode_line("2024/01/01 10:00:00.000\tPress1\tOK\tAll Clear\tp1\tOnce").unwrap();
        assert_eq!(record.client_name, "Press1");
        assert_eq!(record.status, "OK");
        assert_eq!(record.message, "All Clear");
        assert_eq!(record.parameter, "p1");
        assert_eq!(record.check_style, CheckStyle::Once);
        assert!(!record.acknowledged);
    }

    #[test]
    fn test_optional_fields_default() {
        let record = decode_line("2024/01/01 10:00:00.123\tPress1\tNG\tJam\r\n").unwrap();
        assert_eq!(record.parameter, "");
        assert_eq!(record.check_style, CheckStyle::Once);
        assert_eq!(record.key().as_str(), "Press1_2024/01/01 10:00:00.123");

        let record = decode_line("2024/01/01 10:00:00.123\tPress1\tNG\tJam\t\tRecurring").unwrap();
        assert_eq!(record.check_style, CheckStyle::Recurring);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(decode_line("2024/01/01 10:00:00.000\tPress1\tOK").is_err());
        assert!(decode_line("yesterday\tPress1\tOK\tmsg").is_err());
        assert!(decode_line("").is_err());
    }

    #[test]
    fn test_extra_columns_are_ignored() {
        let record =
            decode_line("2024/01/01 10:00:00.000\tPress1\tOK\tmsg\tp\tOnce\textra").unwrap();
        assert_eq!(record.parameter, "p");
        assert_eq!(record.check_style, CheckStyle::Once);
    }

    #[test]
    fn test_unknown_check_style_is_kept_as_recurring() {
        let record = decode_line("2024/01/01 10:00:00.000\tPress1\tOK\tmsg\tp\tonce").unwrap();
        assert_eq!(record.check_style, CheckStyle::Recurring);
        let record =
            decode_line("2024/01/01 10:00:00.000\tPress1\tOK\tmsg\tp\tSometimes").unwrap();
        assert_eq!(record.check_style, CheckStyle::Recurring);
        assert_eq!(record.message, "msg");
    }
}
