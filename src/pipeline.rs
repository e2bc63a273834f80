//! The pipeline orchestrator.
//!
//! Sequences lexing, parsing, resolution, the transform passes, bytecode
//! compilation, packing, and emission, failing fast on the first stage
//! error. Transforms rewrite the AST, so the resolver runs again after each
//! enabled pass; slot and upvalue tables are recomputed rather than patched.
//!
//! Pure computation: no filesystem or network access, and all randomness
//! (keys, generated names, state numbers) lives in a per-invocation
//! `BuildContext` that is never shared or logged.

use serde::{Deserialize, Serialize};

use crate::bytecode::{Compiler, FunctionProto};
use crate::emit::emit;
use crate::error::ObfuscateError;
use crate::lexer::Scanner;
use crate::pack::{pack, pack_encrypted};
use crate::parser::Parser;
use crate::resolve::{Resolution, Resolver};
use crate::transform::{encrypt_strings, flatten_control_flow, BuildContext};

/// The option record the boundary supplies. Field names mirror the public
/// API's JSON config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObfuscationOptions {
    pub vm_encryption: bool,
    pub string_encryption: bool,
    pub control_flow_flattening: bool,
    /// Cosmetic/decoy transforms only; never affects semantics.
    pub memes: bool,
}

impl Default for ObfuscationOptions {
    fn default() -> Self {
        Self {
            vm_encryption: true,
            string_encryption: true,
            control_flow_flattening: true,
            memes: false,
        }
    }
}

impl ObfuscationOptions {
    /// The all-off control baseline: plain VM wrapping only.
    pub fn none() -> Self {
        Self {
            vm_encryption: false,
            string_encryption: false,
            control_flow_flattening: false,
            memes: false,
        }
    }
}

/// Obfuscate a Lua source text. Each call builds fresh key material.
pub fn obfuscate(source: &str, options: &ObfuscationOptions) -> Result<String, ObfuscateError> {
    let mut ctx = BuildContext::new(options.memes);
    obfuscate_with_context(source, options, &mut ctx)
}

/// The pipeline body, with the caller owning the build context (tests use
/// seeded contexts for reproducibility).
pub fn obfuscate_with_context(
    source: &str,
    options: &ObfuscationOptions,
    ctx: &mut BuildContext,
) -> Result<String, ObfuscateError> {
    let tokens = Scanner::new(source).scan_tokens()?;
    let mut chunk = Parser::new(tokens).parse()?;
    let mut resolution = Resolver::new().resolve(&chunk)?;

    if options.string_encryption {
        encrypt_strings(&mut chunk, ctx)?;
        resolution = Resolver::new().resolve(&chunk)?;
    }
    if options.control_flow_flattening {
        flatten_control_flow(&mut chunk, &resolution, ctx)?;
        resolution = Resolver::new().resolve(&chunk)?;
    }

    let proto = Compiler::new(&resolution).compile(&chunk)?;

    let (packed, seed) = if options.vm_encryption {
        let seed = ctx.packer_seed();
        (pack_encrypted(&proto, seed)?, seed)
    } else {
        (pack(&proto)?, 0)
    };

    Ok(emit(&packed, seed, options.memes))
}

/// Compile source straight to a prototype, no transforms. Used by the CLI's
/// check mode and by tests as the behavioral baseline.
pub fn compile_source(source: &str) -> Result<FunctionProto, ObfuscateError> {
    let (proto, _) = compile_source_resolved(source)?;
    Ok(proto)
}

pub(crate) fn compile_source_resolved(
    source: &str,
) -> Result<(FunctionProto, Resolution), ObfuscateError> {
    let tokens = Scanner::new(source).scan_tokens()?;
    let chunk = Parser::new(tokens).parse()?;
    let resolution = Resolver::new().resolve(&chunk)?;
    let proto = Compiler::new(&resolution).compile(&chunk)?;
    Ok((proto, resolution))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ObfuscateError, ResolveError};
    use crate::vm::Vm;

    /// Run a source program directly on the reference VM.
    fn run_direct(source: &str) -> String {
        let proto = compile_source(source).expect("compiles");
        let mut vm = Vm::with_capture();
        vm.run(proto).expect("runs");
        vm.captured_output()
    }

    /// Obfuscate, then execute the *emitted script* on the reference VM.
    fn run_obfuscated(source: &str, options: &ObfuscationOptions) -> String {
        let script = obfuscate(source, options).expect("obfuscates");
        run_direct(&script)
    }

    fn assert_equivalent(source: &str, options: &ObfuscationOptions) {
        let expected = run_direct(source);
        let actual = run_obfuscated(source, options);
        assert_eq!(expected, actual, "behavior diverged for: {}", source);
    }

    #[test]
    fn hello_world_all_options() {
        let source = "print('Hello World')";
        let options = ObfuscationOptions::default();
        let script = obfuscate(source, &options).unwrap();
        // The plaintext never survives into the output.
        assert!(!script.contains("Hello World"));
        let output = run_direct(&script);
        assert_eq!(output, "Hello World\n");
    }

    #[test]
    fn option_independence_baseline() {
        // All options off: plain VM wrap, behavior identical.
        assert_equivalent("print('Hello World')", &ObfuscationOptions::none());
    }

    #[test]
    fn while_with_break_flattening_only() {
        let options = ObfuscationOptions {
            vm_encryption: false,
            string_encryption: false,
            control_flow_flattening: true,
            memes: false,
        };
        let source = "\
local i = 0
while true do
  i = i + 1
  if i >= 5 then break end
end
print(i)";
        assert_equivalent(source, &options);
    }

    #[test]
    fn syntax_error_reports_parse_stage() {
        let result = obfuscate("if x then print(1)", &ObfuscationOptions::default());
        match result {
            Err(err @ ObfuscateError::Parser(_)) => assert_eq!(err.stage(), "parser"),
            other => panic!("expected parser error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn too_many_locals_reports_resolve_stage() {
        let mut source = String::new();
        for i in 0..=200 {
            source.push_str(&format!("local v{} = {}\n", i, i));
        }
        let result = obfuscate(&source, &ObfuscationOptions::none());
        assert!(matches!(
            result,
            Err(ObfuscateError::Resolve(ResolveError::TooManyLocals { .. }))
        ));
    }

    #[test]
    fn fresh_keys_per_invocation() {
        let source = "print('same input')";
        let options = ObfuscationOptions::default();
        let first = obfuscate(source, &options).unwrap();
        let second = obfuscate(source, &options).unwrap();
        // Different embedded seeds and payloads, same behavior.
        assert_ne!(first, second);
        assert_eq!(run_direct(&first), run_direct(&second));
    }

    #[test]
    fn functions_and_upvalues_survive() {
        let source = "\
local function counter()
  local n = 0
  return function()
    n = n + 1
    return n
  end
end
local c = counter()
c()
c()
print(c())";
        assert_equivalent(source, &ObfuscationOptions::default());
    }

    #[test]
    fn loops_and_tables_survive() {
        let source = "\
local t = { 4, 5, 6, label = 'xs' }
local sum = 0
for i = 1, #t do
  sum = sum + t[i]
end
for k, v in ipairs(t) do
  sum = sum + v
end
print(t.label, sum)";
        assert_equivalent(source, &ObfuscationOptions::default());
    }

    #[test]
    fn varargs_and_multiple_returns_survive() {
        let source = "\
local function spread(...)
  return ...
end
local a, b, c = spread(10, 20, 30)
print(a + b + c, select('#', spread(1, 2, 3, 4)))";
        assert_equivalent(source, &ObfuscationOptions::default());
    }

    #[test]
    fn method_calls_survive() {
        let source = "\
local account = { balance = 100 }
function account:deposit(amount)
  self.balance = self.balance + amount
end
account:deposit(50)
print(account.balance)";
        assert_equivalent(source, &ObfuscationOptions::default());
    }

    #[test]
    fn repeat_until_and_generic_for_survive() {
        let source = "\
local words = { 'a', 'b', 'c' }
local joined = ''
local i = 0
repeat
  i = i + 1
  joined = joined .. words[i]
until i >= #words
print(joined)";
        assert_equivalent(source, &ObfuscationOptions::default());
    }

    #[test]
    fn numeric_for_with_step_survives() {
        let source = "\
local acc = {}
for i = 10, 1, -3 do
  acc[#acc + 1] = i
end
print(table.concat(acc, ','))";
        assert_equivalent(source, &ObfuscationOptions::default());
    }

    #[test]
    fn string_escapes_survive_encryption() {
        let options = ObfuscationOptions {
            vm_encryption: false,
            string_encryption: true,
            control_flow_flattening: false,
            memes: false,
        };
        assert_equivalent("print('tab\\there' .. '\\65\\66')", &options);
    }

    #[test]
    fn loop_closure_capture_skips_flattening_but_still_runs() {
        // The safety precondition leaves this function structured; behavior
        // must be unchanged either way.
        let source = "\
local fs = {}
for i = 1, 3 do
  fs[i] = function() return i * 10 end
end
print(fs[1]() + fs[2]() + fs[3]())";
        assert_equivalent(source, &ObfuscationOptions::default());
    }

    #[test]
    fn memes_option_never_changes_semantics() {
        let source = "\
local total = 0
for i = 1, 4 do
  total = total + i
end
print('total', total)";
        let memed = ObfuscationOptions {
            memes: true,
            ..ObfuscationOptions::default()
        };
        assert_equivalent(source, &memed);
    }

    #[test]
    fn flattening_twice_is_behavior_preserving() {
        use crate::bytecode::Compiler;
        use crate::lexer::Scanner;
        use crate::parser::Parser;
        use crate::resolve::Resolver;
        use crate::transform::{flatten_control_flow, BuildContext};

        let source = "\
local total = 0
for i = 1, 3 do
  local j = 0
  while j < i do
    j = j + 1
    total = total + 1
  end
end
print(total)";
        let expected = run_direct(source);

        let tokens = Scanner::new(source).scan_tokens().unwrap();
        let mut chunk = Parser::new(tokens).parse().unwrap();
        let mut ctx = BuildContext::with_seed(77, false);
        for _ in 0..2 {
            let res = Resolver::new().resolve(&chunk).unwrap();
            flatten_control_flow(&mut chunk, &res, &mut ctx).unwrap();
        }
        let res = Resolver::new().resolve(&chunk).unwrap();
        let proto = Compiler::new(&res).compile(&chunk).unwrap();
        let mut vm = Vm::with_capture();
        vm.run(proto).unwrap();
        assert_eq!(vm.captured_output(), expected);
    }

    #[test]
    fn options_deserialize_from_api_json() {
        let options: ObfuscationOptions = serde_json::from_str(
            r#"{"vmEncryption":true,"stringEncryption":false,"controlFlowFlattening":true,"memes":false}"#,
        )
        .unwrap();
        assert!(options.vm_encryption);
        assert!(!options.string_encryption);
        // Missing fields take the documented defaults.
        let partial: ObfuscationOptions = serde_json::from_str(r#"{"memes":true}"#).unwrap();
        assert!(partial.vm_encryption);
        assert!(partial.memes);
    }

    #[test]
    fn no_output_on_failure() {
        // Fail-fast: a lexer error surfaces as the lexer stage, nothing
        // else runs.
        let result = obfuscate("print('unterminated", &ObfuscationOptions::default());
        match result {
            Err(err) => assert_eq!(err.stage(), "lexer"),
            Ok(_) => panic!("expected failure"),
        }
    }
}
