use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, SecondsFormat};
use kre_common::error::{ExporterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converter {
    ToTimestamp,
    ToDatetime,
    ToUpper,
    ToLower,
    Trim,
}

impl Converter {
    /// Names are matched case-insensitively, ignoring `-` and `_`.
    pub fn parse(name: &str) -> Option<Self> {
        let key: String = name
            .trim()
            .chars()
            .filter(|ch| *ch != '-' && *ch != '_')
            .flat_map(char::to_lowercase)
            .collect();

        match key.as_str() {
            "totimestamp" => Some(Self::ToTimestamp),
            "todatetime" => Some(Self::ToDatetime),
            "toupper" => Some(Self::ToUpper),
            "tolower" => Some(Self::ToLower),
            "trim" => Some(Self::Trim),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ToTimestamp => "to-timestamp",
            Self::ToDatetime => "to-datetime",
            Self::ToUpper => "to-upper",
            Self::ToLower => "to-lower",
            Self::Trim => "trim",
        }
    }

    pub fn supports_values(&self) -> bool {
        matches!(self, Self::ToTimestamp)
    }

    fn apply_label(&self, current: Option<String>) -> Option<String> {
        let current = current?;
        match self {
            Self::ToTimestamp => {
                if current.parse::<f64>().is_ok() {
                    return Some(current);
                }
                parse_time(&current).map(|parsed| parsed.timestamp().to_string())
            }
            Self::ToDatetime => {
                if let Ok(seconds) = current.parse::<f64>() {
                    return DateTime::from_timestamp(seconds as i64, 0)
                        .map(|parsed| parsed.to_rfc3339_opts(SecondsFormat::Secs, true));
                }
                parse_time(&current)
                    .map(|parsed| parsed.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
            Self::ToUpper => Some(current.to_uppercase()),
            Self::ToLower => Some(current.to_lowercase()),
            Self::Trim => Some(current.trim().to_string()),
        }
    }
}

impl fmt::Display for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered converter steps. Every step runs, even once the value is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionChain {
    steps: Vec<Converter>,
}

impl ConversionChain {
    pub fn compile_label<S: AsRef<str>>(names: &[S], context: &str) -> Result<Self> {
        let steps = names
            .iter()
            .map(|name| {
                Converter::parse(name.as_ref()).ok_or_else(|| ExporterError::UnknownConverter {
                    context: context.to_string(),
                    name: name.as_ref().to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { steps })
    }

    pub fn compile_value<S: AsRef<str>>(names: &[S], context: &str) -> Result<Self> {
        let chain = Self::compile_label(names, context)?;
        if let Some(step) = chain.steps.iter().find(|step| !step.supports_values()) {
            return Err(ExporterError::UnsupportedValueConverter {
                context: context.to_string(),
                name: step.name().to_string(),
            });
        }
        Ok(chain)
    }

    pub fn apply_label(&self, input: String) -> Option<String> {
        self.steps
            .iter()
            .fold(Some(input), |current, step| step.apply_label(current))
    }

    /// `candidate` is the numeric reading of `text`, if it had one.
    pub fn apply_value(&self, candidate: Option<f64>, text: &str) -> Option<f64> {
        self.steps.iter().fold(candidate, |current, step| match step {
            Converter::ToTimestamp => {
                if current.is_some() {
                    return current;
                }
                parse_time(text).map(|parsed| parsed.timestamp() as f64)
            }
            // rejected by compile_value
            Converter::ToDatetime | Converter::ToUpper | Converter::ToLower | Converter::Trim => {
                current
            }
        })
    }
}

/// Recognised date/time layouts, highest preference first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFormat {
    Rfc3339,
    HumanOffset,
    HumanZone,
    Human,
    Rfc822,
    Rfc822Z,
    Rfc850,
    Rfc1123,
    Rfc1123Z,
    Rfc3339Nano,
    Date,
}

pub const TIME_FORMATS: [TimeFormat; 11] = [
    TimeFormat::Rfc3339,
    TimeFormat::HumanOffset,
    TimeFormat::HumanZone,
    TimeFormat::Human,
    TimeFormat::Rfc822,
    TimeFormat::Rfc822Z,
    TimeFormat::Rfc850,
    TimeFormat::Rfc1123,
    TimeFormat::Rfc1123Z,
    TimeFormat::Rfc3339Nano,
    TimeFormat::Date,
];

impl TimeFormat {
    pub fn parse(&self, input: &str) -> Option<DateTime<FixedOffset>> {
        match self {
            Self::Rfc3339 | Self::Rfc3339Nano => DateTime::parse_from_rfc3339(input).ok(),
            Self::HumanOffset => DateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S %:z").ok(),
            Self::HumanZone => parse_with_zone_abbreviation(input, "%Y-%m-%d %H:%M:%S"),
            Self::Human => parse_naive_utc(input, "%Y-%m-%d %H:%M:%S"),
            Self::Rfc822 => parse_with_zone_abbreviation(input, "%d %b %y %H:%M"),
            Self::Rfc822Z => DateTime::parse_from_str(input, "%d %b %y %H:%M %z").ok(),
            Self::Rfc850 => parse_with_zone_abbreviation(input, "%A, %d-%b-%y %H:%M:%S"),
            Self::Rfc1123 => parse_with_zone_abbreviation(input, "%a, %d %b %Y %H:%M:%S"),
            Self::Rfc1123Z => DateTime::parse_from_str(input, "%a, %d %b %Y %H:%M:%S %z").ok(),
            Self::Date => NaiveDate::parse_from_str(input, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|datetime| datetime.and_utc().fixed_offset()),
        }
    }
}

/// First layout that parses and lands strictly after the Unix epoch wins.
pub fn parse_time(input: &str) -> Option<DateTime<FixedOffset>> {
    TIME_FORMATS.iter().find_map(|format| {
        format
            .parse(input)
            .filter(|parsed| parsed.timestamp() > 0)
    })
}

fn parse_naive_utc(input: &str, layout: &str) -> Option<DateTime<FixedOffset>> {
    NaiveDateTime::parse_from_str(input, layout)
        .ok()
        .map(|datetime| datetime.and_utc().fixed_offset())
}

// Zone abbreviations carry no reliable offset; they are read as UTC.
fn parse_with_zone_abbreviation(input: &str, layout: &str) -> Option<DateTime<FixedOffset>> {
    let (rest, zone) = input.trim().rsplit_once(' ')?;
    let is_abbreviation =
        (3..=5).contains(&zone.len()) && zone.chars().all(|ch| ch.is_ascii_uppercase());
    if !is_abbreviation {
        return None;
    }
    parse_naive_utc(rest, layout)
}

#[cfg(test)]
mod tests {
    use kre_common::error::ExporterError;

    use super::{ConversionChain, Converter, TIME_FORMATS, TimeFormat, parse_time};

    fn label_chain(names: &[&str]) -> ConversionChain {
        ConversionChain::compile_label(names, "test").unwrap()
    }

    #[test]
    fn converter_names_are_normalized() {
        assert_eq!(Converter::parse("to-timestamp"), Some(Converter::ToTimestamp));
        assert_eq!(Converter::parse("toTimestamp"), Some(Converter::ToTimestamp));
        assert_eq!(Converter::parse("TO_UPPER"), Some(Converter::ToUpper));
        assert_eq!(Converter::parse("reverse"), None);
    }

    #[test]
    fn unknown_converter_fails_compile() {
        let err = ConversionChain::compile_label(&["trim", "reverse"], "metric \"x\"")
            .expect_err("unknown converter must fail");
        assert!(err.to_string().contains("reverse"));
        assert!(matches!(
            err,
            ExporterError::UnknownConverter { ref name, .. } if name == "reverse"
        ));
    }

    #[test]
    fn label_only_converter_rejected_for_values() {
        assert!(ConversionChain::compile_value(&["to-timestamp"], "v").is_ok());
        assert!(ConversionChain::compile_value(&["to-upper"], "v").is_err());
        assert!(ConversionChain::compile_value(&["to-datetime"], "v").is_err());
    }

    #[test]
    fn string_converters_are_idempotent() {
        let once = label_chain(&["trim"]);
        let twice = label_chain(&["trim", "trim"]);
        assert_eq!(
            once.apply_label("  padded  ".to_string()),
            twice.apply_label("  padded  ".to_string())
        );

        let upper_once = label_chain(&["to-upper"]);
        let upper_twice = label_chain(&["to-upper", "to-upper"]);
        assert_eq!(
            upper_once.apply_label("Mixed".to_string()),
            upper_twice.apply_label("Mixed".to_string())
        );
        assert_eq!(upper_once.apply_label("Mixed".to_string()).as_deref(), Some("MIXED"));
    }

    #[test]
    fn numeric_label_is_kept_by_to_timestamp() {
        let chain = label_chain(&["to-timestamp"]);
        assert_eq!(chain.apply_label("3".to_string()).as_deref(), Some("3"));
    }

    #[test]
    fn to_timestamp_parses_rfc3339_label() {
        let chain = label_chain(&["to-timestamp"]);
        assert_eq!(
            chain.apply_label("2024-01-01T12:00:00Z".to_string()).as_deref(),
            Some("1704110400")
        );
        assert_eq!(chain.apply_label("not a date".to_string()), None);
    }

    #[test]
    fn absent_value_stays_absent_through_later_steps() {
        let chain = label_chain(&["to-timestamp", "to-upper", "trim"]);
        assert_eq!(chain.apply_label("garbage".to_string()), None);
    }

    #[test]
    fn datetime_timestamp_round_trip() {
        let to_datetime = label_chain(&["to-datetime"]);
        let to_timestamp = label_chain(&["to-timestamp"]);
        for epoch in [1_i64, 86_400, 1_700_000_000, 1_704_110_400] {
            let rendered = to_datetime.apply_label(epoch.to_string()).unwrap();
            let back = to_timestamp.apply_label(rendered).unwrap();
            assert_eq!(back, epoch.to_string());
        }
    }

    #[test]
    fn to_datetime_keeps_parsed_offset() {
        let chain = label_chain(&["to-datetime"]);
        assert_eq!(
            chain.apply_label("2024-01-01 12:00:00 +02:00".to_string()).as_deref(),
            Some("2024-01-01T12:00:00+02:00")
        );
        assert_eq!(
            chain.apply_label("1704110400".to_string()).as_deref(),
            Some("2024-01-01T12:00:00Z")
        );
    }

    #[test]
    fn earliest_accepting_format_wins() {
        let input = "2024-03-05T10:30:00.250+01:00";
        let accepting = TIME_FORMATS
            .iter()
            .copied()
            .filter(|format| format.parse(input).is_some())
            .collect::<Vec<_>>();
        assert_eq!(accepting, vec![TimeFormat::Rfc3339, TimeFormat::Rfc3339Nano]);

        let parsed = parse_time(input).unwrap();
        assert_eq!(Some(parsed), accepting[0].parse(input));
        assert_eq!(parsed.timestamp(), 1_709_631_000);

        let position =
            |wanted: TimeFormat| TIME_FORMATS.iter().position(|format| *format == wanted);
        assert!(position(TimeFormat::Rfc3339) < position(TimeFormat::Rfc3339Nano));
        assert_eq!(position(TimeFormat::Date), Some(TIME_FORMATS.len() - 1));
        assert_eq!(parse_time("2024-03-05").unwrap().timestamp(), 1_709_596_800);
    }

    #[test]
    fn epoch_and_earlier_are_rejected() {
        assert!(TimeFormat::Rfc3339.parse("1970-01-01T00:00:00Z").is_some());
        assert!(parse_time("1970-01-01T00:00:00Z").is_none());
        assert!(parse_time("1969-12-31").is_none());
    }

    #[test]
    fn legacy_formats_parse() {
        assert_eq!(
            parse_time("Mon, 01 Jan 2024 12:00:00 GMT").unwrap().timestamp(),
            1_704_110_400
        );
        assert_eq!(
            parse_time("Mon, 01 Jan 2024 13:00:00 +0100").unwrap().timestamp(),
            1_704_110_400
        );
        assert_eq!(parse_time("01 Jan 24 12:00 UTC").unwrap().timestamp(), 1_704_110_400);
        assert_eq!(parse_time("2024-01-01 12:00:00 UTC").unwrap().timestamp(), 1_704_110_400);
        assert_eq!(parse_time("2024-01-01 12:00:00").unwrap().timestamp(), 1_704_110_400);
    }

    #[test]
    fn non_positive_epochs_are_rejected() {
        assert!(parse_time("1970-01-01T00:00:00Z").is_none());
        assert!(parse_time("1969-12-31").is_none());
    }

    #[test]
    fn value_chain_parses_dates_or_clears() {
        let chain = ConversionChain::compile_value(&["to-timestamp"], "v").unwrap();
        assert_eq!(chain.apply_value(Some(42.0), "42"), Some(42.0));
        assert_eq!(
            chain.apply_value(None, "2024-01-01T12:00:00Z"),
            Some(1_704_110_400.0)
        );
        assert_eq!(chain.apply_value(None, "True"), None);

        let empty = ConversionChain::default();
        assert_eq!(empty.apply_value(None, "True"), None);
        assert_eq!(empty.apply_value(Some(1.5), "1.5"), Some(1.5));
    }
}
