// Helper call snippet tests. Each test compiles a small x86-64 method whose main stream jumps
// to a helper call snippet that branches back to a restart label. A helper inside the code
// cache's reach is called with its literal distance; a helper far outside it is called
// through the trampoline the code cache hands out, and two call sites (in one method, in
// separate methods, or on separate threads) share that trampoline. The tests also check the
// conservative size discipline of the snippet protocol (the emitted snippet never exceeds its
// estimate, and the method never exceeds its reservation), patch padding of patchable calls,
// and the fatal failures: no trampoline available, an unreachable trampoline, an out of range
// restart branch and a snippet that writes more than it estimated.

//! Helper call snippet and trampoline tests.

mod common;

use common::{init_logging, Environment, Op, ScriptedBackend, CACHE_BASE, FAR_HELPER, NEAR_HELPER};
use emitcore::codegen::{CodeGenerator, LabelId, PhaseDriver};
use emitcore::core::test_utils::TestContext;
use emitcore::core::{CompileConfig, CompileError, CompileResult};
use emitcore::debug;
use emitcore::runtime::{CodeCacheManager, HelperId, HelperTable};
use emitcore::snippet::{EmitContext, EstimateContext, HelperCallSnippet, PrintContext, Snippet};
use emitcore::target::ArchitectureEncoder;
use emitcore::x64::X64Target;
use std::fmt;

/// Destination of the `call rel32` at `offset` of a method placed at `base`.
fn call_destination(code: &[u8], offset: usize, base: u64) -> u64 {
    assert_eq!(code[offset], 0xe8, "no call at {offset:#x}");
    let rel = i32::from_le_bytes([
        code[offset + 1],
        code[offset + 2],
        code[offset + 3],
        code[offset + 4],
    ]);
    (base + offset as u64 + 5).wrapping_add(rel as i64 as u64)
}

/// Main stream `jmp snippet; restart: ret` plus one snippet per helper.
fn compile_calls(
    cg: &mut CodeGenerator<'_, '_>,
    helpers: &[HelperId],
) -> CompileResult<(ScriptedBackend, LabelId)> {
    let restart = cg.create_label();
    let mut ops = Vec::new();
    for &helper in helpers {
        let label = cg.create_label();
        cg.add_snippet(Box::new(HelperCallSnippet::new(label, helper).with_restart(restart)))?;
        ops.push(Op::Jump(label));
    }
    ops.push(Op::Bind(restart));
    ops.push(Op::Bytes(vec![0xc3]));
    let mut backend = ScriptedBackend::new(ops);
    PhaseDriver::standard().perform_all(cg, &mut backend)?;
    Ok((backend, restart))
}

#[test]
fn helper_in_range_is_called_directly() {
    init_logging();
    let (env, near, _) = Environment::new(CompileConfig::default());
    let ctx = TestContext::new();
    let session = ctx.create_session();
    let mut cg = env.code_generator(&session);

    let (_, restart) = compile_calls(&mut cg, &[near]).unwrap();
    let base = cg.buffer.start();
    assert_eq!(base, CACHE_BASE);
    assert_eq!(cg.labels.address(restart), Some(base + 5));

    // jmp to the snippet right after the 6 byte main stream
    let code = cg.code();
    assert_eq!(i32::from_le_bytes([code[1], code[2], code[3], code[4]]), 1);

    // call at 6 encodes the literal distance
    assert_eq!(call_destination(code, 6, base), NEAR_HELPER);
    let rel = i32::from_le_bytes([code[7], code[8], code[9], code[10]]) as i64;
    assert_eq!(rel, NEAR_HELPER as i64 - (base as i64 + 11));
    assert!(env.target.is_call_displacement_encodable(rel));

    // short jmp back to the restart label
    assert_eq!(code[11], 0xeb);
    assert_eq!(code[12] as i8, -8);

    assert_eq!(cg.buffer.estimated_length(), 16);
    assert_eq!(cg.buffer.actual_length(), 13);
    let emitted = cg.snippets.emitted();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].estimate, 7);
    assert_eq!(emitted[0].length, 7);
    assert_eq!(session.stats().trampolines_used, 0);
    assert_eq!(env.caches.trampoline_count(base), 0);
}

#[test]
fn helper_out_of_range_goes_through_a_trampoline() {
    init_logging();
    let (env, _, far) = Environment::new(CompileConfig::default());
    let ctx = TestContext::new();
    let session = ctx.create_session();
    let mut cg = env.code_generator(&session);

    compile_calls(&mut cg, &[far]).unwrap();
    let base = cg.buffer.start();
    let trampoline = call_destination(cg.code(), 6, base);

    assert_ne!(trampoline, FAR_HELPER);
    assert!(trampoline > base + 13 && trampoline < CACHE_BASE + common::CACHE_SIZE);
    let rel = trampoline as i64 - (base as i64 + 11);
    assert!(env.target.is_call_displacement_encodable(rel));
    assert!(!env
        .target
        .is_call_displacement_encodable(FAR_HELPER as i64 - (base as i64 + 11)));

    // jmp [rip]; dq helper
    let image = env.caches.trampoline_bytes(trampoline).unwrap();
    assert_eq!(&image[..2], &[0xff, 0x25]);
    assert_eq!(&image[6..14], &FAR_HELPER.to_le_bytes());
    assert_eq!(session.stats().trampolines_used, 1);

    let dump = debug::snippet_dump(&cg);
    assert!(dump.contains("jitFarHelper"));
    assert!(dump.contains(&format!("through trampoline {trampoline:#x}")));
}

#[test]
fn call_sites_share_one_trampoline() {
    init_logging();
    let (env, _, far) = Environment::new(CompileConfig::default());
    let ctx = TestContext::new();

    let session = ctx.create_session();
    let mut first = env.code_generator(&session);
    compile_calls(&mut first, &[far, far]).unwrap();
    let first_base = first.buffer.start();
    // two jumps and a ret, then two 7 byte snippets
    let a = call_destination(first.code(), 11, first_base);
    let b = call_destination(first.code(), 18, first_base);
    assert_eq!(a, b);
    assert_eq!(first.buffer.estimated_length(), 31);
    assert_eq!(first.buffer.actual_length(), 25);

    let other = ctx.create_session();
    let mut second = env.code_generator(&other);
    compile_calls(&mut second, &[far]).unwrap();
    let second_base = second.buffer.start();
    assert!(second_base >= first_base + 31);
    assert_eq!(call_destination(second.code(), 6, second_base), a);

    assert_eq!(env.caches.trampoline_count(first_base), 1);
    for (base, offset) in [(first_base, 11), (first_base, 18), (second_base, 6)] {
        let reference = base as i64 + offset + 5;
        assert!(env.target.is_call_displacement_encodable(a as i64 - reference));
    }
}

#[test]
fn concurrent_compilations_share_one_trampoline() {
    init_logging();
    let (env, _, far) = Environment::new(CompileConfig::default());

    let destinations: Vec<u64> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let env = &env;
                scope.spawn(move || {
                    let ctx = TestContext::new();
                    let session = ctx.create_session();
                    let mut cg = env.code_generator(&session);
                    compile_calls(&mut cg, &[far]).unwrap();
                    call_destination(cg.code(), 6, cg.buffer.start())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(destinations.iter().all(|&d| d == destinations[0]));
    assert_eq!(env.caches.trampoline_count(CACHE_BASE), 1);
}

#[test]
fn patchable_call_displacement_stays_in_one_window() {
    init_logging();
    let (env, near, _) = Environment::new(CompileConfig::default());
    let ctx = TestContext::new();
    let session = ctx.create_session();
    let mut cg = env.code_generator(&session);

    let label = cg.create_label();
    cg.add_snippet(Box::new(HelperCallSnippet::new(label, near).patchable()))
        .unwrap();
    let mut backend = ScriptedBackend::new(vec![Op::Jump(label), Op::Bytes(vec![0xc3])]);
    PhaseDriver::standard()
        .perform_all(&mut cg, &mut backend)
        .unwrap();

    // worst case padding is reserved, one NOP is needed at 0x...06
    assert_eq!(cg.buffer.estimated_length(), 6 + 7 + 5);
    let code = cg.code();
    assert_eq!(code[6], 0x90);
    assert_eq!(call_destination(code, 7, cg.buffer.start()), NEAR_HELPER);
    let field = cg.buffer.address_of(8);
    assert!(field % 8 + 4 <= 8);
}

#[test]
fn snippets_cannot_be_added_after_placement() {
    init_logging();
    let (env, near, _) = Environment::new(CompileConfig::default());
    let ctx = TestContext::new();
    let session = ctx.create_session();
    let mut cg = env.code_generator(&session);
    compile_calls(&mut cg, &[near]).unwrap();

    let late = cg.create_label();
    let err = cg
        .add_snippet(Box::new(HelperCallSnippet::new(late, near)))
        .unwrap_err();
    assert!(matches!(err, CompileError::SnippetProtocol { .. }));
    let err = cg
        .find_or_create_constant(emitcore::snippet::ConstantValue::Double(1.5))
        .unwrap_err();
    assert!(matches!(err, CompileError::SnippetProtocol { .. }));
}

/// Cache that never has room for trampolines, or hands out one out of reach.
struct FixedCache {
    base: u64,
    trampoline: Option<u64>,
}

impl CodeCacheManager for FixedCache {
    fn reserve_code(&self, _length: u32, _alignment: u32) -> CompileResult<u64> {
        Ok(self.base)
    }

    fn find_helper_trampoline(&self, _helper: HelperId, _from: u64) -> Option<u64> {
        self.trampoline
    }
}

fn compile_with_cache(cache: &FixedCache) -> CompileError {
    let mut helpers = HelperTable::new();
    let far = helpers.register("jitFarHelper", FAR_HELPER);
    let config = CompileConfig::default();
    let target = X64Target::new();
    let ctx = TestContext::new();
    let session = ctx.create_session();
    let mut cg = CodeGenerator::new(&session, &config, &target, cache, &helpers);
    match compile_calls(&mut cg, &[far]) {
        Ok(_) => panic!("call to {FAR_HELPER:#x} compiled without a trampoline"),
        Err(e) => e,
    }
}

#[test]
fn missing_trampoline_is_fatal() {
    init_logging();
    let err = compile_with_cache(&FixedCache {
        base: CACHE_BASE,
        trampoline: None,
    });
    match &err {
        CompileError::TrampolineUnavailable { helper, from } => {
            assert_eq!(helper, "jitFarHelper");
            assert_eq!(*from, CACHE_BASE + 6);
        }
        other => panic!("unexpected {other}"),
    }
    assert!(err.is_fatal());
}

#[test]
fn unreachable_trampoline_is_fatal() {
    init_logging();
    let err = compile_with_cache(&FixedCache {
        base: CACHE_BASE,
        trampoline: Some(0x7000_0000_0000),
    });
    assert!(matches!(
        err,
        CompileError::TrampolineUnreachable {
            trampoline: 0x7000_0000_0000,
            ..
        }
    ));
    assert!(err.to_string().contains("should be reachable directly"));
}

#[test]
fn restart_out_of_branch_range_is_fatal() {
    init_logging();
    let (env, near, _) = Environment::new(CompileConfig::default());
    let ctx = TestContext::new();
    let session = ctx.create_session();
    let mut cg = env.code_generator(&session);

    let label = cg.create_label();
    let restart = cg.create_label();
    cg.labels.resolve(restart, 0x7000_0000_0000).unwrap();
    cg.add_snippet(Box::new(HelperCallSnippet::new(label, near).with_restart(restart)))
        .unwrap();
    let mut backend = ScriptedBackend::new(vec![Op::Jump(label)]);
    let err = PhaseDriver::standard()
        .perform_all(&mut cg, &mut backend)
        .unwrap_err();
    assert!(matches!(
        err,
        CompileError::RestartBranchOutOfRange {
            to: 0x7000_0000_0000,
            ..
        }
    ));
}

/// Snippet that writes more than it promised.
struct Overrun {
    label: LabelId,
}

impl Snippet for Overrun {
    fn label(&self) -> LabelId {
        self.label
    }

    fn name(&self) -> &'static str {
        "Overrun"
    }

    fn length(&self, _estimated_start: u32, _cx: &EstimateContext<'_>) -> u32 {
        4
    }

    fn emit_body(&mut self, cx: &mut EmitContext<'_, '_>) -> CompileResult<()> {
        cx.bind_label(self.label)?;
        cx.buffer.emit_bytes(&[0xcc; 8])?;
        Ok(())
    }

    fn print(&self, out: &mut dyn fmt::Write, _cx: &PrintContext<'_>) -> fmt::Result {
        writeln!(out, "{} Overrun", self.label)
    }
}

#[test]
fn snippet_writing_past_its_estimate_is_fatal() {
    init_logging();
    let (env, _, _) = Environment::new(CompileConfig::default());
    let ctx = TestContext::new();
    let session = ctx.create_session();
    let mut cg = env.code_generator(&session);

    let label = cg.create_label();
    cg.add_snippet(Box::new(Overrun { label })).unwrap();
    let mut backend = ScriptedBackend::new(vec![Op::Bytes(vec![0xc3])]);
    backend.slack = 16;
    let err = PhaseDriver::standard()
        .perform_all(&mut cg, &mut backend)
        .unwrap_err();
    assert!(matches!(
        err,
        CompileError::SnippetEstimateExceeded {
            snippet: "Overrun",
            estimate: 4,
            actual: 8,
        }
    ));
}

/// One byte snippet whose listing always fails.
struct Unprintable {
    label: LabelId,
}

impl Snippet for Unprintable {
    fn label(&self) -> LabelId {
        self.label
    }

    fn name(&self) -> &'static str {
        "Unprintable"
    }

    fn length(&self, _estimated_start: u32, _cx: &EstimateContext<'_>) -> u32 {
        1
    }

    fn emit_body(&mut self, cx: &mut EmitContext<'_, '_>) -> CompileResult<()> {
        cx.bind_label(self.label)?;
        cx.buffer.emit_u8(0xcc)?;
        Ok(())
    }

    fn print(&self, _out: &mut dyn fmt::Write, _cx: &PrintContext<'_>) -> fmt::Result {
        Err(fmt::Error)
    }
}

#[test]
fn failed_snippet_listing_does_not_fail_the_compilation() {
    init_logging();
    let mut config = CompileConfig::default();
    config.trace_snippets = true;
    let (env, _, _) = Environment::new(config);
    let ctx = TestContext::new();
    let session = ctx.create_session();
    let mut cg = env.code_generator(&session);

    let label = cg.create_label();
    cg.add_snippet(Box::new(Unprintable { label })).unwrap();
    let mut backend = ScriptedBackend::new(vec![Op::Bytes(vec![0xc3])]);
    PhaseDriver::standard()
        .perform_all(&mut cg, &mut backend)
        .unwrap();

    assert_eq!(cg.code()[0], 0xc3);
    assert_eq!(*cg.code().last().unwrap(), 0xcc);
    assert_eq!(session.stats().snippets_emitted, 1);
}
