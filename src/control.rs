//! The control protocol (§6): a line-based command grammar dispatched
//! against a [`Registry`]. This module is transport-free by design — no
//! UNIX socket, no control thread — matching the Non-goal that the
//! socket/mount surfaces are external collaborators. What's here is the
//! actual grammar and command set, kept separate from any transport the
//! way the teacher keeps `backend.rs` (the engine) apart from `ux.rs`/
//! `menu.rs` (the presentation glue that would drive it).

use crate::api::Geometry;
use crate::cipher::CipherSpec;
use crate::error::Error;
use crate::registry::Registry;

/// One fully-formed reply: `OK\n`/`ERR\n` followed by payload lines,
/// terminated by a line containing a single `.`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub ok: bool,
    pub lines: Vec<String>,
}

impl Response {
    pub fn ok(lines: Vec<String>) -> Self { Response { ok: true, lines } }

    pub fn ok_empty() -> Self { Response { ok: true, lines: Vec::new() } }

    pub fn err(message: impl Into<String>) -> Self { Response { ok: false, lines: vec![message.into()] } }

    /// Renders the reply exactly as it goes out over the wire.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(if self.ok { "OK\n" } else { "ERR\n" });
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(".\n");
        out
    }
}

impl From<Error> for Response {
    fn from(e: Error) -> Self { Response::err(e.wire_message()) }
}

fn hex_decode(s: &str) -> Result<Vec<u8>, Error> {
    if s.len() % 2 != 0 {
        return Err(Error::config(format!("'{s}' is not valid hex (odd length)")));
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for pair in bytes.chunks(2) {
        let hi = (pair[0] as char).to_digit(16).ok_or_else(|| Error::config(format!("'{s}' is not valid hex")))?;
        let lo = (pair[1] as char).to_digit(16).ok_or_else(|| Error::config(format!("'{s}' is not valid hex")))?;
        out.push(((hi << 4) | lo) as u8);
    }
    Ok(out)
}

fn parse_bool(s: &str) -> Result<bool, Error> {
    match s {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(Error::config(format!("'{other}' is not a boolean"))),
    }
}

const HELP_TEXT: &[&str] = &[
    "static-info",
    "p",
    "check-available NAME",
    "open-internal NAME CIPHER_SPEC KEY_HEX",
    "create-internal NAME CIPHER_SPEC KEY_HEX",
    "close NAME",
    "info NAME",
    "resize-internal NAME BLOCKS RESERVED",
    "cycle NAME COUNT",
    "verbose-ordered NAME",
    "check-data-integrity NAME",
    "set-aux NAME KEY VAL",
    "get-aux NAME KEY",
    "set-close-on-release NAME BOOL",
    "help-internal",
    "exit",
];

/// Parses and executes one command line against `registry`. `geometry` is
/// the backing store's fixed macroblock/mesoblock split, needed by
/// `create-internal` to size a fresh partition.
pub fn dispatch(registry: &mut Registry, geometry: Geometry, line: &str) -> Response {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(&cmd) = tokens.first() else {
        return Response::err("empty command");
    };
    let args = &tokens[1..];
    match (cmd, args) {
        ("static-info", []) => Response::ok(vec![
            format!("macroblock_log={}", geometry.macroblock_log),
            format!("mesoblock_log={}", geometry.mesoblock_log),
            format!("mmpm={}", geometry.mmpm()),
            format!("no_raw_macroblocks={}", registry.no_raw_macroblocks()),
        ]),
        ("p", []) => Response::ok(registry.list_names()),
        ("check-available", [name]) => {
            Response::ok(vec![registry.check_available(name).to_string()])
        }
        ("open-internal", [name, cipher_spec, key_hex]) => {
            let spec = match CipherSpec::parse(cipher_spec) {
                Ok(s) => s,
                Err(e) => return e.into(),
            };
            let key = match hex_decode(key_hex) {
                Ok(k) => k,
                Err(e) => return e.into(),
            };
            match registry.open(*name, &spec, &key) {
                Ok(()) => Response::ok_empty(),
                Err(e) => e.into(),
            }
        }
        ("create-internal", [name, cipher_spec, key_hex]) => {
            let spec = match CipherSpec::parse(cipher_spec) {
                Ok(s) => s,
                Err(e) => return e.into(),
            };
            let key = match hex_decode(key_hex) {
                Ok(k) => k,
                Err(e) => return e.into(),
            };
            let total = registry.unassigned_count() as u32;
            if total == 0 {
                return Response::err("no unassigned macroblocks left on this backing store");
            }
            let reserved = if total >= 2 { 1 } else { 0 };
            match registry.create(*name, &spec, &key, total, reserved) {
                Ok(()) => Response::ok_empty(),
                Err(e) => e.into(),
            }
        }
        ("close", [name]) => match registry.close(name) {
            Ok(()) => Response::ok_empty(),
            Err(e) => e.into(),
        },
        ("info", [name]) => match registry.partition(name) {
            Ok(p) => Response::ok(vec![
                format!("no_macroblocks={}", p.no_macroblocks()),
                format!("reserved={}", p.reserved()),
                format!("logical_size={}", p.logical_size()),
                format!("used_macroblocks={}", p.used_macroblock_count()),
            ]),
            Err(e) => e.into(),
        },
        ("resize-internal", [name, blocks, reserved]) => {
            let blocks: u32 = match blocks.parse() {
                Ok(v) => v,
                Err(_) => return Response::err(format!("'{blocks}' is not a block count")),
            };
            let reserved: u32 = match reserved.parse() {
                Ok(v) => v,
                Err(_) => return Response::err(format!("'{reserved}' is not a reserved count")),
            };
            match registry.resize(name, blocks, reserved) {
                Ok(()) => Response::ok_empty(),
                Err(e) => e.into(),
            }
        }
        ("cycle", [name, count]) => {
            let count: u32 = match count.parse() {
                Ok(v) => v,
                Err(_) => return Response::err(format!("'{count}' is not a count")),
            };
            let partition = match registry.partition_mut(name) {
                Ok(p) => p,
                Err(e) => return e.into(),
            };
            for _ in 0..count {
                if let Err(e) = partition.cycle() {
                    return e.into();
                }
            }
            Response::ok_empty()
        }
        ("verbose-ordered", [name]) => match registry.partition(name) {
            Ok(p) => Response::ok(vec![
                format!("useful={}", p.useful),
                format!("wasted_gc={}", p.wasted_gc),
                format!("wasted_empty={}", p.wasted_empty),
            ]),
            Err(e) => e.into(),
        },
        ("check-data-integrity", [name]) => match registry.partition_mut(name) {
            Ok(p) => match p.check_data_integrity() {
                Ok(true) => Response::ok(vec!["OK".to_string()]),
                Ok(false) => Response::err("data integrity check failed"),
                Err(e) => e.into(),
            },
            Err(e) => e.into(),
        },
        ("set-aux", [name, key, val]) => match registry.set_aux(name, *key, *val) {
            Ok(()) => Response::ok_empty(),
            Err(e) => e.into(),
        },
        ("get-aux", [name, key]) => match registry.get_aux(name, key) {
            Ok(Some(val)) => Response::ok(vec![val]),
            Ok(None) => Response::ok(vec![]),
            Err(e) => e.into(),
        },
        ("set-close-on-release", [name, value]) => {
            let value = match parse_bool(value) {
                Ok(v) => v,
                Err(e) => return e.into(),
            };
            match registry.set_close_on_release(name, value) {
                Ok(()) => Response::ok_empty(),
                Err(e) => e.into(),
            }
        }
        ("help-internal", []) => Response::ok(HELP_TEXT.iter().map(|s| s.to_string()).collect()),
        ("exit", []) => Response::ok_empty(),
        (other, _) => Response::err(format!("unrecognized command or wrong argument count: '{other}'")),
    }
}

/// CLI flags documented by §6, out of scope for wiring to an actual
/// `main.rs` (the Non-goal covers the front-end binary). Kept as a plain
/// struct so the grammar itself is real, testable code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    /// `-b FILE`
    pub backing_store: std::path::PathBuf,
    /// `-m MESOBLOCK_LOG`
    pub mesoblock_log: u8,
    /// `-M MACROBLOCK_LOG`
    pub macroblock_log: u8,
    /// `-r RESERVED`
    pub reserved: u32,
}

impl Default for CliArgs {
    fn default() -> Self {
        CliArgs {
            backing_store: std::path::PathBuf::new(),
            mesoblock_log: crate::api::DEFAULT_MESOBLOCK_LOG,
            macroblock_log: crate::api::DEFAULT_MACROBLOCK_LOG,
            reserved: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_geometry() -> Geometry { Geometry::new(16, 12).unwrap() }

    fn make_registry(no_raw: u64) -> (tempfile::NamedTempFile, Registry) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(no_raw * small_geometry().macroblock_size() as u64).unwrap();
        let reg = Registry::init(tmp.path(), small_geometry()).unwrap();
        (tmp, reg)
    }

    #[test]
    fn static_info_reports_geometry() {
        let (_tmp, mut reg) = make_registry(4);
        let resp = dispatch(&mut reg, small_geometry(), "static-info");
        assert!(resp.ok);
        assert!(resp.lines.iter().any(|l| l.starts_with("mmpm=")));
    }

    #[test]
    fn create_open_close_round_trip() {
        let (_tmp, mut reg) = make_registry(4);
        let g = small_geometry();
        let key_hex = "41".repeat(32);
        let resp = dispatch(&mut reg, g, &format!("create-internal p CBC_ESSIV(AES256) {key_hex}"));
        assert!(resp.ok, "{resp:?}");
        let resp = dispatch(&mut reg, g, "check-available p");
        assert_eq!(resp.lines, vec!["false"]);
        let resp = dispatch(&mut reg, g, "close p");
        assert!(resp.ok, "{resp:?}");
    }

    #[test]
    fn unrecognized_command_is_an_error() {
        let (_tmp, mut reg) = make_registry(4);
        let resp = dispatch(&mut reg, small_geometry(), "not-a-real-command");
        assert!(!resp.ok);
    }

    #[test]
    fn malformed_key_hex_is_config_error() {
        let (_tmp, mut reg) = make_registry(4);
        let resp = dispatch(&mut reg, small_geometry(), "create-internal p CBC_ESSIV(AES256) zz");
        assert!(!resp.ok);
    }

    #[test]
    fn response_render_terminates_with_dot() {
        let resp = Response::ok(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(resp.render(), "OK\na\nb\n.\n");
        let resp = Response::err("boom");
        assert_eq!(resp.render(), "ERR\nboom\n.\n");
    }
}
