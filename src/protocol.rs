//! Wire protocol: request parsing and response rendering.
//!
//! Line-oriented, `\n`-terminated (a trailing `\r` is tolerated and
//! stripped). Each line splits into at most three whitespace-separated
//! parts: command, first argument, and "the rest of the line" — `multi`/
//! `bulk` keys and `create`'s optional capacity/probability pair live in
//! that third part and are split again on their own.

use std::sync::atomic::Ordering;

use crate::config::FilterOverrides;
use crate::entry::Counters;
use crate::error::BloomdError;
use crate::manager::FilterInfo;

pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, PartialEq)]
pub enum Request {
    Create { name: String, overrides: FilterOverrides },
    Drop(String),
    Close(String),
    Check { name: String, key: Vec<u8> },
    Multi { name: String, keys: Vec<Vec<u8>> },
    Set { name: String, key: Vec<u8> },
    Bulk { name: String, keys: Vec<Vec<u8>> },
    Info(String),
    List,
    Flush(Option<String>),
    Conf(Option<String>),
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
}

fn missing_name() -> BloomdError {
    BloomdError::ClientError("Must provide filter name".into())
}

fn bad_name() -> BloomdError {
    BloomdError::ClientError("Bad filter name".into())
}

impl Request {
    /// Parses a single protocol line. The caller has already stripped the
    /// trailing `\n`/`\r\n`.
    pub fn parse(line: &str) -> Result<Request, BloomdError> {
        let line = line.trim();
        let mut parts = line.splitn(3, ' ');
        let cmd = parts.next().unwrap_or("");
        let arg1 = parts.next();
        let rest = parts.next();

        match cmd {
            "create" => {
                let name = arg1.ok_or_else(missing_name)?.to_string();
                if !is_valid_name(&name) {
                    return Err(bad_name());
                }
                let mut overrides = FilterOverrides::default();
                if let Some(rest) = rest {
                    let mut tokens = rest.split_whitespace();
                    if let Some(cap) = tokens.next() {
                        let capacity: usize = cap
                            .parse()
                            .map_err(|_| BloomdError::ClientError("Bad initial capacity!".into()))?;
                        crate::config::validate_capacity_override(capacity)?;
                        overrides.initial_capacity = Some(capacity);
                    }
                    if let Some(prob) = tokens.next() {
                        let probability: f64 = prob.parse().map_err(|_| {
                            BloomdError::ClientError("Bad false positive probability!".into())
                        })?;
                        crate::config::validate_probability_override(probability)?;
                        overrides.default_probability = Some(probability);
                    }
                }
                Ok(Request::Create { name, overrides })
            }
            "drop" => Ok(Request::Drop(arg1.ok_or_else(missing_name)?.to_string())),
            "close" => Ok(Request::Close(arg1.ok_or_else(missing_name)?.to_string())),
            "c" | "check" => {
                let name = arg1.ok_or_else(missing_name)?.to_string();
                let key = rest
                    .ok_or_else(|| BloomdError::ClientError("Must provide filter name and key".into()))?
                    .as_bytes()
                    .to_vec();
                Ok(Request::Check { name, key })
            }
            "m" | "multi" => {
                let name = arg1.ok_or_else(missing_name)?.to_string();
                let keys = split_keys(rest)?;
                Ok(Request::Multi { name, keys })
            }
            "s" | "set" => {
                let name = arg1.ok_or_else(missing_name)?.to_string();
                let key = rest
                    .ok_or_else(|| BloomdError::ClientError("Must provide filter name and key".into()))?
                    .as_bytes()
                    .to_vec();
                Ok(Request::Set { name, key })
            }
            "b" | "bulk" => {
                let name = arg1.ok_or_else(missing_name)?.to_string();
                let keys = split_keys(rest)?;
                Ok(Request::Bulk { name, keys })
            }
            "info" => Ok(Request::Info(arg1.ok_or_else(missing_name)?.to_string())),
            "list" => Ok(Request::List),
            "flush" => Ok(Request::Flush(arg1.map(|s| s.to_string()))),
            "conf" => Ok(Request::Conf(arg1.map(|s| s.to_string()))),
            "" => Err(BloomdError::ClientError("Command not supported".into())),
            _ => Err(BloomdError::ClientError("Command not supported".into())),
        }
    }
}

fn split_keys(rest: Option<&str>) -> Result<Vec<Vec<u8>>, BloomdError> {
    let rest = rest.ok_or_else(|| {
        BloomdError::ClientError("Must provide filter name and at least one key".into())
    })?;
    let keys: Vec<Vec<u8>> = rest.trim().split(' ').map(|k| k.as_bytes().to_vec()).collect();
    if keys.is_empty() {
        return Err(BloomdError::ClientError(
            "Must provide filter name and at least one key".into(),
        ));
    }
    Ok(keys)
}

/// What a handled request renders back to the wire: either a single line
/// or a `START`/body-lines/`END` block. `render()` always returns the full
/// set of lines to send, in order.
pub enum Response {
    Done,
    Yes,
    No,
    BoolList(Vec<bool>),
    List(Vec<FilterInfo>),
    Info(FilterInfo, InfoCounters),
    Conf(Vec<(String, String)>),
    Error(String),
}

/// A point-in-time snapshot of `Counters`, since the atomics themselves
/// aren't `Clone`. Includes the derived `sets`/`checks` totals alongside
/// the raw hit/miss/page counters.
pub struct InfoCounters {
    pub set_hits: u64,
    pub set_misses: u64,
    pub check_hits: u64,
    pub check_misses: u64,
    pub page_outs: u64,
    pub page_ins: u64,
    pub sets: u64,
    pub checks: u64,
}

impl InfoCounters {
    pub fn snapshot(counters: &Counters) -> Self {
        InfoCounters {
            set_hits: counters.set_hits.load(Ordering::Relaxed),
            set_misses: counters.set_misses.load(Ordering::Relaxed),
            check_hits: counters.check_hits.load(Ordering::Relaxed),
            check_misses: counters.check_misses.load(Ordering::Relaxed),
            page_outs: counters.page_outs.load(Ordering::Relaxed),
            page_ins: counters.page_ins.load(Ordering::Relaxed),
            sets: counters.sets(),
            checks: counters.checks(),
        }
    }
}

impl Response {
    pub fn from_error(err: &BloomdError) -> Response {
        match err {
            BloomdError::NotFound => Response::Error("Filter does not exist".into()),
            BloomdError::AlreadyExists => Response::Error("Exists".into()),
            BloomdError::ClientError(msg) => Response::Error(format!("Client Error: {msg}")),
            BloomdError::Internal(_) | BloomdError::Io(_) | BloomdError::Config(_) | BloomdError::FormatMismatch { .. } => {
                Response::Error("Internal Error".into())
            }
        }
    }

    /// Renders the full set of lines to write to the wire, in order. The
    /// caller appends a trailing newline per line (the codec's job).
    pub fn render(&self) -> Vec<String> {
        match self {
            Response::Done => vec!["Done".into()],
            Response::Yes => vec!["Yes".into()],
            Response::No => vec!["No".into()],
            Response::Error(msg) => vec![msg.clone()],
            Response::BoolList(flags) => {
                let mut lines = vec!["START".to_string()];
                lines.extend(flags.iter().map(|f| if *f { "Yes".to_string() } else { "No".to_string() }));
                lines.push("END".to_string());
                lines
            }
            Response::List(rows) => {
                let mut lines = vec!["START".to_string()];
                for row in rows {
                    lines.push(format!(
                        "{} {} {} {} {}",
                        row.name, row.probability, row.byte_size, row.capacity, row.len
                    ));
                }
                lines.push("END".to_string());
                lines
            }
            Response::Info(row, counters) => {
                let mut fields = vec![
                    ("capacity".to_string(), row.capacity.to_string()),
                    ("check_hits".to_string(), counters.check_hits.to_string()),
                    ("check_misses".to_string(), counters.check_misses.to_string()),
                    ("checks".to_string(), counters.checks.to_string()),
                    ("page_ins".to_string(), counters.page_ins.to_string()),
                    ("page_outs".to_string(), counters.page_outs.to_string()),
                    ("probability".to_string(), row.probability.to_string()),
                    ("set_hits".to_string(), counters.set_hits.to_string()),
                    ("set_misses".to_string(), counters.set_misses.to_string()),
                    ("sets".to_string(), counters.sets.to_string()),
                    ("size".to_string(), row.len.to_string()),
                    ("storage".to_string(), row.byte_size.to_string()),
                ];
                fields.sort_by(|a, b| a.0.cmp(&b.0));
                let mut lines = vec!["START".to_string()];
                lines.extend(fields.into_iter().map(|(k, v)| format!("{k} {v}")));
                lines.push("END".to_string());
                lines
            }
            Response::Conf(fields) => {
                let mut fields = fields.clone();
                fields.sort_by(|a, b| a.0.cmp(&b.0));
                let mut lines = vec!["START".to_string()];
                lines.extend(fields.into_iter().map(|(k, v)| format!("{k} {v}")));
                lines.push("END".to_string());
                lines
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_with_overrides() {
        let req = Request::parse("create events 5000 0.01").unwrap();
        match req {
            Request::Create { name, overrides } => {
                assert_eq!(name, "events");
                assert_eq!(overrides.initial_capacity, Some(5000));
                assert_eq!(overrides.default_probability, Some(0.01));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_create_without_overrides() {
        let req = Request::parse("create events").unwrap();
        match req {
            Request::Create { name, overrides } => {
                assert_eq!(name, "events");
                assert_eq!(overrides.initial_capacity, None);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_bad_name() {
        let err = Request::parse("create bad name!").unwrap_err();
        assert!(matches!(err, BloomdError::ClientError(_)));
    }

    #[test]
    fn parses_multi_keys() {
        let req = Request::parse("multi events alpha beta gamma").unwrap();
        match req {
            Request::Multi { name, keys } => {
                assert_eq!(name, "events");
                assert_eq!(keys, vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn aliases_map_to_same_variant() {
        assert_eq!(
            Request::parse("c events alpha").unwrap(),
            Request::parse("check events alpha").unwrap()
        );
        assert_eq!(
            Request::parse("s events alpha").unwrap(),
            Request::parse("set events alpha").unwrap()
        );
    }

    #[test]
    fn unknown_command_is_client_error() {
        let err = Request::parse("frobnicate events").unwrap_err();
        assert!(matches!(err, BloomdError::ClientError(_)));
    }

    #[test]
    fn bool_list_renders_start_end_block() {
        let resp = Response::BoolList(vec![true, false]);
        assert_eq!(resp.render(), vec!["START", "Yes", "No", "END"]);
    }

    #[test]
    fn not_found_maps_to_filter_does_not_exist() {
        let resp = Response::from_error(&BloomdError::NotFound);
        assert_eq!(resp.render(), vec!["Filter does not exist"]);
    }
}
