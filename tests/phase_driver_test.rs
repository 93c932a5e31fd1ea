// Phase driver tests. A scripted x86-64 backend stands in for instruction selection and
// register assignment; the driver runs its phases in list order, dispatching binary encoding,
// snippet emission and relocation processing to the code generator itself. The tests cover a
// complete compilation through the standard phase list (estimate, reservation, encoding and
// patching of a backward jump), the phase marker seen from inside a phase, the per phase
// profiles recorded in the session, cooperative interruption at the instruction selection
// checkpoint (no later phase may run, and the error is not fatal), rejection of phase lists
// that violate the emission order, and the estimate check that fails a compilation whose
// backend under-estimated its own instruction stream.

//! Phase driver and emission phase tests.

mod common;

use common::{init_logging, Environment, Op, ScriptedBackend, CACHE_BASE};
use emitcore::codegen::{InterruptFlag, Phase, PhaseDriver};
use emitcore::core::test_utils::TestContext;
use emitcore::core::{CompileConfig, CompileError};

#[test]
fn standard_phases_emit_and_patch_a_method() {
    init_logging();
    let (env, _, _) = Environment::new(CompileConfig::default());
    let ctx = TestContext::new();
    let session = ctx.create_session();
    session.set_current_method("loop");
    let mut cg = env.code_generator(&session);

    let head = cg.create_label();
    let mut backend = ScriptedBackend::new(vec![
        Op::Bytes(vec![0x55]),
        Op::Bind(head),
        Op::Bytes(vec![0x90, 0x90]),
        Op::Jump(head),
        Op::Bytes(vec![0xc3]),
    ]);

    PhaseDriver::standard()
        .perform_all(&mut cg, &mut backend)
        .unwrap();

    assert_eq!(cg.buffer.start(), CACHE_BASE);
    assert_eq!(cg.labels.address(head), Some(CACHE_BASE + 1));
    assert_eq!(cg.buffer.estimated_length(), 9);
    assert_eq!(cg.buffer.actual_length(), 9);

    // jmp at offset 3 returns to offset 1: rel32 = 1 - 8
    let code = cg.code();
    assert_eq!(code[3], 0xe9);
    let rel = i32::from_le_bytes([code[4], code[5], code[6], code[7]]);
    assert_eq!(rel, -7);
    assert_eq!(code[8], 0xc3);

    let stats = session.stats();
    assert_eq!(stats.code_size, 9);
    assert_eq!(stats.estimated_code_size, 9);
    assert_eq!(stats.relocations_applied, 1);
    assert_eq!(stats.external_groups, 0);
    assert!(cg.relocations.is_processed());
}

#[test]
fn backend_phases_see_their_own_marker() {
    init_logging();
    let (env, _, _) = Environment::new(CompileConfig::default());
    let ctx = TestContext::new();
    let session = ctx.create_session();
    let mut cg = env.code_generator(&session);
    let mut backend = ScriptedBackend::new(vec![Op::Bytes(vec![0xc3])]);

    let driver = PhaseDriver::standard();
    driver.perform_all(&mut cg, &mut backend).unwrap();

    let delegated: Vec<Phase> = driver
        .phases()
        .iter()
        .copied()
        .filter(|p| {
            !matches!(
                p,
                Phase::ReserveCodeCache
                    | Phase::BinaryEncoding
                    | Phase::EmitSnippets
                    | Phase::ProcessRelocations
            )
        })
        .collect();
    assert_eq!(backend.phases, delegated);
    for (phase, seen) in backend.phases.iter().zip(&backend.current_phases) {
        assert_eq!(Some(*phase), *seen);
    }
    assert_eq!(emitcore::codegen::current_phase(), None);
}

#[test]
fn every_phase_is_profiled() {
    init_logging();
    let (env, _, _) = Environment::new(CompileConfig::default());
    let ctx = TestContext::new();
    let session = ctx.create_session();
    let mut cg = env.code_generator(&session);
    let mut backend = ScriptedBackend::new(vec![Op::Bytes(vec![0x90; 32])]);

    let driver = PhaseDriver::standard();
    driver.perform_all(&mut cg, &mut backend).unwrap();

    let stats = session.stats();
    assert_eq!(stats.phases_run, driver.phases().len());
    let profiled: Vec<Phase> = stats.phase_profiles.iter().map(|p| p.phase).collect();
    assert_eq!(profiled, driver.phases());

    let selection = stats
        .phase_profiles
        .iter()
        .find(|p| p.phase == Phase::InstructionSelection)
        .unwrap();
    assert!(selection.transient_bytes >= 32);

    // the code bytes come from the session arena during binary encoding
    let encoding = stats
        .phase_profiles
        .iter()
        .find(|p| p.phase == Phase::BinaryEncoding)
        .unwrap();
    assert!(encoding.arena_growth >= 32);
}

#[test]
fn interruption_stops_at_instruction_selection() {
    init_logging();
    let (env, _, _) = Environment::new(CompileConfig::default());
    let ctx = TestContext::new();
    let session = ctx.create_session();
    let mut cg = env.code_generator(&session);

    let flag = InterruptFlag::new();
    let driver = PhaseDriver::standard().with_interrupt(flag.clone());
    let mut backend = ScriptedBackend::new(vec![Op::Bytes(vec![0xc3])]);
    let requester = flag.clone();
    backend.on_selection = Some(Box::new(move || requester.interrupt()));

    let err = driver.perform_all(&mut cg, &mut backend).unwrap_err();
    assert!(matches!(
        err,
        CompileError::Interrupted {
            phase: Phase::InstructionSelection
        }
    ));
    assert!(!err.is_fatal());
    assert!(!backend.phases.contains(&Phase::RegisterAssigning));
    assert_eq!(backend.phases.last(), Some(&Phase::InstructionSelection));
    assert!(!cg.buffer.is_reserved());
    assert!(driver.interrupt_flag().is_set());
}

#[test]
fn interruption_is_only_observed_at_checkpoints() {
    init_logging();
    let (env, _, _) = Environment::new(CompileConfig::default());
    let ctx = TestContext::new();
    let session = ctx.create_session();
    let mut cg = env.code_generator(&session);

    // no checkpoint in this list
    let driver = PhaseDriver::new(vec![
        Phase::LowerTrees,
        Phase::BinaryEncoding,
        Phase::EmitSnippets,
        Phase::ProcessRelocations,
    ])
    .unwrap();
    driver.interrupt_flag().interrupt();
    let mut backend = ScriptedBackend::new(vec![Op::Bytes(vec![0xc3])]);
    driver.perform_all(&mut cg, &mut backend).unwrap();
    assert_eq!(cg.code(), &[0xc3]);
}

#[test]
fn phase_lists_must_respect_emission_order() {
    let swapped = PhaseDriver::new(vec![
        Phase::BinaryEncoding,
        Phase::ProcessRelocations,
        Phase::EmitSnippets,
    ]);
    assert!(matches!(swapped, Err(CompileError::PhaseOrder { .. })));

    let late_atlas = PhaseDriver::new(vec![Phase::BinaryEncoding, Phase::CreateStackAtlas]);
    assert!(matches!(late_atlas, Err(CompileError::PhaseOrder { .. })));

    let assign_first = PhaseDriver::new(vec![Phase::RegisterAssigning, Phase::InstructionSelection]);
    assert!(matches!(assign_first, Err(CompileError::PhaseOrder { .. })));

    let no_encoding = PhaseDriver::new(vec![Phase::EmitSnippets, Phase::ProcessRelocations]);
    assert!(matches!(no_encoding, Err(CompileError::PhaseOrder { .. })));

    let twice = PhaseDriver::new(vec![Phase::Peephole, Phase::Peephole]);
    assert!(matches!(twice, Err(CompileError::PhaseOrder { .. })));

    assert!(PhaseDriver::new(vec![Phase::LowerTrees, Phase::InliningReport]).is_ok());
}

#[test]
fn under_estimated_main_stream_fails_the_compilation() {
    init_logging();
    let (env, _, _) = Environment::new(CompileConfig::default());
    let ctx = TestContext::new();
    let session = ctx.create_session();
    let mut cg = env.code_generator(&session);
    let mut backend = ScriptedBackend::new(vec![Op::Bytes(vec![0x90; 16])]);
    backend.under_estimate = 4;

    let err = PhaseDriver::standard()
        .perform_all(&mut cg, &mut backend)
        .unwrap_err();
    assert!(matches!(
        err,
        CompileError::EstimateExceeded {
            estimated: 12,
            ..
        }
    ));
    assert!(err.is_fatal());
}

#[test]
fn entry_alignment_pads_before_the_method() {
    init_logging();
    let config = CompileConfig::default().with_entry_alignment(32, 8);
    let (env, _, _) = Environment::new(config);
    let ctx = TestContext::new();
    let session = ctx.create_session();
    let mut cg = env.code_generator(&session);

    let entry = cg.create_label();
    let mut backend = ScriptedBackend::new(vec![
        Op::Bytes(vec![0xcc; 8]),
        Op::Bind(entry),
        Op::Bytes(vec![0xc3]),
    ]);
    PhaseDriver::standard()
        .perform_all(&mut cg, &mut backend)
        .unwrap();

    // the cache hands out 32-byte aligned memory, so 24 bytes of padding put
    // the 8 pre-entry bytes just before the boundary
    assert_eq!(cg.buffer.entry_padding(), 24);
    assert_eq!(cg.labels.address(entry), Some(CACHE_BASE + 32));
    assert_eq!(cg.buffer.code_start(), CACHE_BASE + 24);
    assert_eq!(cg.buffer.estimated_length(), 9 + 31);
    assert_eq!(cg.buffer.actual_length(), 24 + 9);
}
