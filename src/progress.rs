/// Progress line parsing: turn one line of transfer-tool output into telemetry.
///
/// Recognizes rsync-style `--progress` lines such as:
///
/// ```text
///     823,915,288  35%   36.65MB/s    0:00:40 (xfr#1, to-chk=0/3)
/// ```
///
/// Anything else is a status line (usually the name of the file in flight).
use serde::Serialize;

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;

/// Telemetry extracted from a single progress line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    /// Cumulative bytes transferred for the current file.
    pub bytes_transferred: u64,
    /// Percent complete as reported, not range-checked.
    pub percent_transferred: f64,
    /// Current transfer rate in bytes per second.
    pub transfer_rate: u64,
    /// Estimated time remaining, passed through verbatim (`H:MM:SS`).
    pub eta: String,
}

/// A rate token that looked like a rate but could not be converted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateError {
    /// The token is not of the form `<decimal><unit>/s`.
    Malformed { token: String },
    /// The unit is something other than KB or MB.
    UnknownUnit { unit: String, token: String },
}

impl std::fmt::Display for RateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateError::Malformed { token } => write!(f, "malformed rate token {token:?}"),
            RateError::UnknownUnit { unit, token } => {
                write!(f, "unknown rate unit {unit:?} in {token:?}")
            }
        }
    }
}

impl std::error::Error for RateError {}

/// Parse a line into a `TelemetrySample`.
///
/// Returns `Ok(None)` when the line is not a progress line and
/// `Err(RateError)` when it is one but the rate unit is not understood.
pub fn parse_progress_line(line: &str) -> Result<Option<TelemetrySample>, RateError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();

    // Percent needs a bytes token before it and rate + eta after it.
    for i in 1..tokens.len().saturating_sub(2) {
        let Some(fields) = match_fields(&tokens, i) else {
            continue;
        };
        let transfer_rate = parse_rate(fields.rate)?;
        return Ok(Some(TelemetrySample {
            bytes_transferred: fields.bytes,
            percent_transferred: fields.percent,
            transfer_rate,
            eta: fields.eta.to_string(),
        }));
    }
    Ok(None)
}

/// Convert a rate token like `6.8MB/s` or `32.4kB/s` to bytes per second.
pub fn parse_rate(token: &str) -> Result<u64, RateError> {
    let Some((value, unit)) = split_rate(token) else {
        return Err(RateError::Malformed {
            token: token.to_string(),
        });
    };
    let value: f64 = value.parse().map_err(|_| RateError::Malformed {
        token: token.to_string(),
    })?;

    let multiplier = match unit.to_ascii_uppercase().as_str() {
        "KB" => KIB,
        "MB" => MIB,
        _ => {
            return Err(RateError::UnknownUnit {
                unit: unit.to_string(),
                token: token.to_string(),
            })
        }
    };
    Ok((value * multiplier).round() as u64)
}

struct ProgressFields<'a> {
    bytes: u64,
    percent: f64,
    rate: &'a str,
    eta: &'a str,
}

fn match_fields<'a>(tokens: &[&'a str], i: usize) -> Option<ProgressFields<'a>> {
    let percent = tokens[i]
        .strip_suffix('%')
        .filter(|p| is_decimal(p))
        .and_then(|p| p.parse::<f64>().ok())?;
    let bytes = parse_grouped_integer(tokens[i - 1])?;
    let rate = tokens[i + 1];
    split_rate(rate)?;
    let eta = eta_prefix(tokens[i + 2])?;
    Some(ProgressFields {
        bytes,
        percent,
        rate,
        eta,
    })
}

/// Parse the trailing run of digits and grouping commas in `token`.
fn parse_grouped_integer(token: &str) -> Option<u64> {
    let start = token
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit() || *c == ',')
        .last()
        .map(|(idx, _)| idx)?;
    let digits: String = token[start..].chars().filter(|c| *c != ',').collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Split `<decimal><letters>/s` into its value and unit parts.
fn split_rate(token: &str) -> Option<(&str, &str)> {
    let body = token.strip_suffix("/s")?;
    let unit_start = body.find(|c: char| c.is_ascii_alphabetic())?;
    let (value, unit) = body.split_at(unit_start);
    if !is_decimal(value) || !unit.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some((value, unit))
}

/// Leading `D+:DD:DD` of a token, if present.
fn eta_prefix(token: &str) -> Option<&str> {
    let bytes = token.as_bytes();
    let hours = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
    if hours == 0 {
        return None;
    }
    let rest = &bytes[hours..];
    let shape_ok = rest.len() >= 6
        && rest[0] == b':'
        && rest[1].is_ascii_digit()
        && rest[2].is_ascii_digit()
        && rest[3] == b':'
        && rest[4].is_ascii_digit()
        && rest[5].is_ascii_digit();
    shape_ok.then(|| &token[..hours + 6])
}

fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit() || c == '.')
}
