//! Output assembly: interpreter template + packed payload + key material.

pub mod template;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

pub use template::INTERPRETER;

/// Compose the final script: payload constants first, then the fixed
/// interpreter, which ends by booting the payload with the script's own
/// varargs.
pub fn emit(packed: &[u8], seed: u32, memes: bool) -> String {
    let payload = STANDARD.encode(packed);
    let mut out = String::with_capacity(INTERPRETER.len() + payload.len() + 256);

    out.push_str("-- Protected with luaveil. This build is machine generated.\n");
    if memes {
        out.push_str("-- certified hood classic below, good luck reading it\n");
        out.push_str("-- (deobfuscators hate this one weird trick)\n");
    }
    out.push_str("local LV_PAYLOAD = \"");
    out.push_str(&payload);
    out.push_str("\"\n");
    out.push_str("local LV_SEED = ");
    out.push_str(&seed.to_string());
    out.push('\n');
    out.push_str(INTERPRETER);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Scanner;
    use crate::parser::Parser;

    #[test]
    fn emitted_text_is_valid_lua() {
        let script = emit(b"LVBC\x01\x00payload", 1234, false);
        let tokens = Scanner::new(&script).scan_tokens().unwrap();
        assert!(Parser::new(tokens).parse().is_ok());
    }

    #[test]
    fn payload_and_seed_are_embedded() {
        let script = emit(b"LVBC\x01\x00abc", 99, false);
        let encoded = STANDARD.encode(b"LVBC\x01\x00abc");
        assert!(script.contains(&encoded));
        assert!(script.contains("local LV_SEED = 99"));
    }

    #[test]
    fn meme_banner_is_cosmetic_only() {
        let plain = emit(b"LVBC\x01\x00abc", 7, false);
        let memed = emit(b"LVBC\x01\x00abc", 7, true);
        // Strip comment lines; the executable text must be identical.
        let strip = |s: &str| {
            s.lines()
                .filter(|l| !l.starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        assert_eq!(strip(&plain), strip(&memed));
    }

    #[test]
    fn interpreter_template_parses_standalone() {
        let script = format!(
            "local LV_PAYLOAD = \"\"\nlocal LV_SEED = 0\n{}",
            INTERPRETER
        );
        let tokens = Scanner::new(&script).scan_tokens().unwrap();
        assert!(Parser::new(tokens).parse().is_ok());
    }
}
