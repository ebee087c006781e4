//! End-to-end tests of the dot-to-AMX lowering.
//!
//! Rewritten modules are executed with the reference interpreter next to the
//! original module on the same inputs; memory contents and returned values
//! must match exactly. Inputs are small integers so every partial sum is
//! exact in the accumulator type.

use amx_legalize::amx::candidate::{MAX_ACC_TILES, MAX_TILE_DIM, TILE_ROW_BITS};
use amx_legalize::amx::{
    analyze_dot, AccMode, AmxOptions, ConvertDotToAmx, PassReport, Rejection,
};
use amx_legalize::core::PassSession;
use amx_legalize::ir::{Buffer, ElemType, Interpreter, Module, OpId, OpKind, RtValue};
use bumpalo::Bump;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn matrix(rows: i64, cols: i64, elem: ElemType, seed: i64) -> Buffer {
    Buffer::from_fn(rows, cols, elem, |r, c| ((r * 7 + c * 3 + seed) % 5 - 2) as f64)
}

fn first_dot(module: &Module) -> OpId {
    module
        .walk()
        .into_iter()
        .find(|&op| module.op(op).kind == OpKind::Dot)
        .expect("module has a dot")
}

/// Run `func` on copies of `inputs`; returns the final buffers and the
/// returned values.
fn execute(module: &Module, func: &str, inputs: &[Buffer]) -> (Vec<Buffer>, Vec<RtValue>) {
    let mut interp = Interpreter::new(module);
    let args: Vec<RtValue> = inputs.iter().cloned().map(|b| interp.add_buffer(b)).collect();
    let returned = interp
        .run(func, &args)
        .unwrap_or_else(|e| panic!("interpreting @{} failed: {}", func, e));
    let buffers = args.iter().map(|a| interp.buffer(a).unwrap().clone()).collect();
    (buffers, returned)
}

fn run_pass(module: &mut Module, options: AmxOptions) -> PassReport {
    let arena = Bump::new();
    let session = PassSession::new(&arena);
    ConvertDotToAmx::new(options).run(module, &session)
}

/// Convert `text` and check the result computes what the original does.
fn assert_equivalent(text: &str, func: &str, inputs: &[Buffer], options: AmxOptions) -> Module {
    init_logging();
    let original = Module::parse(text).unwrap();
    let mut converted = original.clone();
    let report = run_pass(&mut converted, options);
    assert_eq!(report.converted, 1, "expected one conversion:\n{}", converted);
    assert_eq!(report.failed, 0);
    assert_eq!(converted.count_ops("dot"), 0, "dot left behind:\n{}", converted);
    converted.verify().unwrap();

    let expected = execute(&original, func, inputs);
    let actual = execute(&converted, func, inputs);
    assert_eq!(actual, expected, "results differ after conversion:\n{}", converted);
    converted
}

// =============================================================================
// Scenarios
// =============================================================================

const INT8_STORE: &str = r#"
func @f(%a: memref<16x16xi8>, %b: memref<16x16xi8>, %c: memref<16x16xi32>) {
  %c0 = const 0 : index
  %lhs = read %a[%c0, %c0] : vector<16x16xi8>
  %rhs = read %b[%c0, %c0] : vector<16x16xi8>
  %acc = read %c[%c0, %c0] : vector<16x16xi32>
  %res = dot %lhs, %rhs, %acc : vector<16x16xi32>
  write %res, %c[%c0, %c0]
  return
}
"#;

#[test]
fn test_scenario_a_int8_single_tile() {
    let module = Module::parse(INT8_STORE).unwrap();
    let candidate = analyze_dot(&module, first_dot(&module), &AmxOptions::all()).unwrap();
    assert_eq!((candidate.tile_m, candidate.tile_n, candidate.tile_k), (16, 16, 16));
    assert_eq!((candidate.tiles_in_block_m, candidate.tiles_in_block_n), (1, 1));
    assert_eq!(candidate.acc_mode, AccMode::Unlooped);
    assert_eq!(candidate.acc_tile_elem_ty, ElemType::I32);
    assert!(candidate.orig_store.is_some());

    let inputs = [
        matrix(16, 16, ElemType::I8, 0),
        matrix(16, 16, ElemType::I8, 1),
        matrix(16, 16, ElemType::I32, 2),
    ];
    let converted = assert_equivalent(INT8_STORE, "f", &inputs, AmxOptions::all());
    assert_eq!(converted.count_ops("tile_muli"), 1);
    // The accumulator spill and the packing copy; the original store is gone.
    assert_eq!(converted.count_ops("write"), 2, "{}", converted);
}

#[test]
fn test_scenario_b_small_shape_rejected() {
    init_logging();
    let text = r#"
func @f(%a: memref<4x4xi8>, %c: memref<4x4xi32>) {
  %c0 = const 0 : index
  %v = read %a[%c0, %c0] : vector<4x4xi8>
  %acc = read %c[%c0, %c0] : vector<4x4xi32>
  %res = dot %v, %v, %acc : vector<4x4xi32>
  write %res, %c[%c0, %c0]
  return
}
"#;
    let mut module = Module::parse(text).unwrap();
    let rejection = analyze_dot(&module, first_dot(&module), &AmxOptions::all()).unwrap_err();
    assert_eq!(rejection, Rejection::TooSmall);

    let printed = module.print();
    let report = run_pass(&mut module, AmxOptions::all());
    assert_eq!(report, PassReport { candidates: 0, converted: 0, failed: 0, rejected: 1 });
    assert_eq!(module.print(), printed);
}

#[test]
fn test_scenario_c_fp16_required_but_disabled() {
    let text = r#"
func @f(%a: memref<16x32xf16>, %b: memref<32x16xf8E5M2>) {
  %c0 = const 0 : index
  %lhs = read %a[%c0, %c0] : vector<16x32xf16>
  %rhs = read %b[%c0, %c0] : vector<32x16xf8E5M2>
  %acc = const 0.0 : vector<16x16xf32>
  %res = dot %lhs, %rhs, %acc : vector<16x16xf32>
  return %res
}
"#;
    let module = Module::parse(text).unwrap();
    let bf16_only = AmxOptions { convert_bf16: true, ..AmxOptions::default() };
    let rejection = analyze_dot(&module, first_dot(&module), &bf16_only).unwrap_err();
    assert_eq!(rejection, Rejection::Fp16Disabled);

    let fp16 = AmxOptions { convert_fp16: true, ..AmxOptions::default() };
    let candidate = analyze_dot(&module, first_dot(&module), &fp16).unwrap();
    assert_eq!(candidate.rhs_tile_elem_ty, ElemType::F16);
}

const LOOP_64: &str = r#"
func @big(%a: memref<64x32xbf16>, %b: memref<32x64xbf16>, %c: memref<64x64xf32>) {
  %c0 = const 0 : index
  %c1 = const 1 : index
  %c2 = const 2 : index
  %init = read %c[%c0, %c0] : vector<64x64xf32>
  %r = for %i = %c0 to %c2 step %c1 iter(%acc = %init : vector<64x64xf32>) {
    %lhs = read %a[%c0, %c0] : vector<64x32xbf16>
    %rhs = read %b[%c0, %c0] : vector<32x64xbf16>
    %res = dot %lhs, %rhs, %acc : vector<64x64xf32>
    yield %res
  }
  write %r, %c[%c0, %c0]
  return
}
"#;

#[test]
fn test_scenario_d_large_loop_accumulator() {
    let module = Module::parse(LOOP_64).unwrap();
    let candidate = analyze_dot(&module, first_dot(&module), &AmxOptions::all()).unwrap();
    assert_eq!((candidate.tiles_in_block_m, candidate.tiles_in_block_n), (2, 2));
    assert_eq!(candidate.acc_mode, AccMode::KeepInBuffer);
    assert!(candidate.out_buf.is_empty());

    let inputs = [
        matrix(64, 32, ElemType::BF16, 0),
        matrix(32, 64, ElemType::BF16, 3),
        matrix(64, 64, ElemType::F32, 1),
    ];
    let converted = assert_equivalent(LOOP_64, "big", &inputs, AmxOptions::all());
    // 4x4 accumulator tiles, one reduction step per iteration.
    assert_eq!(converted.count_ops("tile_mulf"), 16);
    assert_eq!(converted.count_ops("tile_store"), 16);
}

// =============================================================================
// Accumulator modes
// =============================================================================

const KEEP_ON_TILES: &str = r#"
func @loop(%a: memref<16x128xbf16>, %b: memref<64x32xbf16>, %c: memref<16x16xf32>) {
  %c0 = const 0 : index
  %c2 = const 2 : index
  %c16 = const 16 : index
  %c64 = const 64 : index
  %init = const 0.0 : vector<16x16xf32>
  %r = for %kp = %c0 to %c64 step %c16 iter(%acc = %init : vector<16x16xf32>) {
    %k = muli %kp, %c2 : index
    %lhs = read %a[%c0, %k] : vector<16x32xbf16>
    %rhs = read %b[%kp, %c0] {packed} : vector<32x16xbf16>
    %res = dot %lhs, %rhs, %acc : vector<16x16xf32>
    yield %res
  }
  write %r, %c[%c0, %c0]
  return
}
"#;

#[test]
fn test_keep_on_tiles_with_direct_store() {
    let module = Module::parse(KEEP_ON_TILES).unwrap();
    let candidate = analyze_dot(&module, first_dot(&module), &AmxOptions::all()).unwrap();
    assert_eq!(candidate.acc_mode, AccMode::KeepOnTiles);
    assert!(candidate.orig_store.is_some());

    let inputs = [
        matrix(16, 128, ElemType::BF16, 4),
        matrix(64, 32, ElemType::BF16, 2),
        matrix(16, 16, ElemType::F32, 0),
    ];
    let converted = assert_equivalent(KEEP_ON_TILES, "loop", &inputs, AmxOptions::all());
    // Both operands reuse their memory and prefetch the next iteration.
    assert_eq!(converted.count_ops("alloca"), 0);
    assert_eq!(converted.count_ops("prefetch"), 2);
    assert_eq!(converted.count_ops("tile_zero"), 1);
    assert_eq!(converted.count_ops("tile_store"), 1);
}

#[test]
fn test_keep_on_tiles_result_read_back() {
    let text = r#"
func @loop(%a: memref<32x64xbf16>, %b: memref<64x16xbf16>, %c: memref<32x16xf32>) {
  %c0 = const 0 : index
  %c1 = const 1 : index
  %c3 = const 3 : index
  %init = read %c[%c0, %c0] : vector<32x16xf32>
  %r = for %i = %c0 to %c3 step %c1 iter(%acc = %init : vector<32x16xf32>) {
    %lhs = read %a[%c0, %c0] : vector<32x64xbf16>
    %rhs = read %b[%c0, %c0] : vector<64x16xbf16>
    %res = dot %lhs, %rhs, %acc : vector<32x16xf32>
    yield %res
  }
  return %r
}
"#;
    let module = Module::parse(text).unwrap();
    let candidate = analyze_dot(&module, first_dot(&module), &AmxOptions::all()).unwrap();
    assert_eq!(candidate.acc_mode, AccMode::KeepOnTiles);
    assert!(candidate.orig_store.is_none());

    let inputs = [
        matrix(32, 64, ElemType::BF16, 1),
        matrix(64, 16, ElemType::BF16, 2),
        matrix(32, 16, ElemType::F32, 3),
    ];
    let converted = assert_equivalent(text, "loop", &inputs, AmxOptions::all());
    assert_eq!(converted.count_ops("tile_mulf"), 4);
    // Two accumulator tiles are stored once after the loop.
    assert_eq!(converted.count_ops("tile_store"), 2);
}

#[test]
fn test_unlooped_result_returned() {
    let text = r#"
func @f(%a: memref<16x128xi8>, %b: memref<128x32xi8>) {
  %c0 = const 0 : index
  %lhs = read %a[%c0, %c0] : vector<16x128xi8>
  %rhs = read %b[%c0, %c0] : vector<128x32xi8>
  %acc = const 0 : vector<16x32xi32>
  %res = dot %lhs, %rhs, %acc : vector<16x32xi32>
  return %res
}
"#;
    let inputs = [matrix(16, 128, ElemType::I8, 0), matrix(128, 32, ElemType::I8, 1)];
    let converted = assert_equivalent(text, "f", &inputs, AmxOptions::all());
    // Zero accumulator: no buffer, two tiles start at zero.
    assert_eq!(converted.count_ops("tile_zero"), 2);
    // 1x2 tiles, K = 128 in steps of 64.
    assert_eq!(converted.count_ops("tile_muli"), 4);
}

#[test]
fn test_fp8_inputs_promoted_to_bf16() {
    let text = r#"
func @f(%a: memref<16x32xf8E5M2>, %b: memref<32x16xf8E5M2>, %c: memref<16x16xf32>) {
  %c0 = const 0 : index
  %lhs = read %a[%c0, %c0] : vector<16x32xf8E5M2>
  %rhs = read %b[%c0, %c0] : vector<32x16xf8E5M2>
  %acc = read %c[%c0, %c0] : vector<16x16xf32>
  %res = dot %lhs, %rhs, %acc : vector<16x16xf32>
  write %res, %c[%c0, %c0]
  return
}
"#;
    let module = Module::parse(text).unwrap();
    let candidate = analyze_dot(&module, first_dot(&module), &AmxOptions::all()).unwrap();
    assert_eq!(candidate.lhs_tile_elem_ty, ElemType::BF16);
    assert_eq!(candidate.rhs_tile_elem_ty, ElemType::BF16);

    let inputs = [
        matrix(16, 32, ElemType::F8E5M2, 0),
        matrix(32, 16, ElemType::F8E5M2, 2),
        matrix(16, 16, ElemType::F32, 1),
    ];
    let converted = assert_equivalent(text, "f", &inputs, AmxOptions::all());
    assert_eq!(converted.count_ops("cast"), 2);
}

#[test]
fn test_multi_block_direct_store() {
    let text = r#"
func @f(%a: memref<32x64xbf16>, %b: memref<64x64xbf16>, %c: memref<32x64xf32>) {
  %c0 = const 0 : index
  %lhs = read %a[%c0, %c0] : vector<32x64xbf16>
  %rhs = read %b[%c0, %c0] : vector<64x64xbf16>
  %acc = read %c[%c0, %c0] : vector<32x64xf32>
  %res = dot %lhs, %rhs, %acc : vector<32x64xf32>
  write %res, %c[%c0, %c0]
  return
}
"#;
    let module = Module::parse(text).unwrap();
    let candidate = analyze_dot(&module, first_dot(&module), &AmxOptions::all()).unwrap();
    assert_eq!((candidate.tiles_in_block_m, candidate.tiles_in_block_n), (2, 2));

    let inputs = [
        matrix(32, 64, ElemType::BF16, 3),
        matrix(64, 64, ElemType::BF16, 1),
        matrix(32, 64, ElemType::F32, 4),
    ];
    let converted = assert_equivalent(text, "f", &inputs, AmxOptions::all());
    // 8 accumulator tiles times 2 reduction steps.
    assert_eq!(converted.count_ops("tile_mulf"), 16);
    assert_eq!(converted.count_ops("tile_store"), 8);
}

#[test]
fn test_fp16_result_cast_back() {
    let text = r#"
func @f(%a: memref<32x64xf16>, %b: memref<64x48xf16>, %c: memref<32x48xf16>) {
  %c0 = const 0 : index
  %lhs = read %a[%c0, %c0] : vector<32x64xf16>
  %rhs = read %b[%c0, %c0] : vector<64x48xf16>
  %acc = read %c[%c0, %c0] : vector<32x48xf16>
  %res = dot %lhs, %rhs, %acc : vector<32x48xf16>
  return %res
}
"#;
    let fp16 = AmxOptions { convert_fp16: true, ..AmxOptions::default() };
    let module = Module::parse(text).unwrap();
    let candidate = analyze_dot(&module, first_dot(&module), &fp16).unwrap();
    assert_eq!(candidate.lhs_tile_elem_ty, ElemType::F16);
    assert_eq!(candidate.acc_tile_elem_ty, ElemType::F32);
    assert_eq!(candidate.tile_k, 32);
    // 2x3 accumulator tiles, N halved to fit the tile budget.
    assert_eq!((candidate.tiles_in_block_m, candidate.tiles_in_block_n), (2, 1));

    let inputs = [
        matrix(32, 64, ElemType::F16, 2),
        matrix(64, 48, ElemType::F16, 0),
        matrix(32, 48, ElemType::F16, 1),
    ];
    let converted = assert_equivalent(text, "f", &inputs, fp16);
    assert_eq!(converted.count_ops("tile_mulf"), 12);
    // f16 -> f32 for the accumulator, f32 -> f16 for the result.
    assert_eq!(converted.count_ops("cast"), 2);
}

// =============================================================================
// Memory written around the dot
// =============================================================================

#[test]
fn test_operand_memory_overwritten_before_dot() {
    let text = r#"
func @f(%a: memref<16x16xi8>, %b: memref<16x16xi8>, %c: memref<16x16xi32>, %o: memref<16x16xi8>) {
  %c0 = const 0 : index
  %lhs = read %a[%c0, %c0] : vector<16x16xi8>
  %rhs = read %b[%c0, %c0] : vector<16x16xi8>
  %other = read %o[%c0, %c0] : vector<16x16xi8>
  write %other, %a[%c0, %c0]
  %acc = read %c[%c0, %c0] : vector<16x16xi32>
  %res = dot %lhs, %rhs, %acc : vector<16x16xi32>
  write %res, %c[%c0, %c0]
  return
}
"#;
    let module = Module::parse(text).unwrap();
    let candidate = analyze_dot(&module, first_dot(&module), &AmxOptions::all()).unwrap();
    assert!(candidate.orig_store.is_some());

    let inputs = [
        matrix(16, 16, ElemType::I8, 0),
        matrix(16, 16, ElemType::I8, 1),
        matrix(16, 16, ElemType::I32, 2),
        matrix(16, 16, ElemType::I8, 4),
    ];
    let converted = assert_equivalent(text, "f", &inputs, AmxOptions::all());
    // %lhs is copied out instead of loaded from the overwritten %a; %rhs is
    // packed and the accumulator spilled as usual.
    assert_eq!(converted.count_ops("alloca"), 3, "{}", converted);
}

#[test]
fn test_memory_written_between_dot_and_store() {
    let text = r#"
func @f(%a: memref<16x16xi8>, %b: memref<16x16xi8>, %c: memref<16x16xi32>, %o: memref<16x16xi8>) {
  %c0 = const 0 : index
  %lhs = read %a[%c0, %c0] : vector<16x16xi8>
  %rhs = read %b[%c0, %c0] : vector<16x16xi8>
  %acc = read %c[%c0, %c0] : vector<16x16xi32>
  %res = dot %lhs, %rhs, %acc : vector<16x16xi32>
  %other = read %o[%c0, %c0] : vector<16x16xi8>
  write %other, %a[%c0, %c0]
  write %res, %c[%c0, %c0]
  return
}
"#;
    let module = Module::parse(text).unwrap();
    let candidate = analyze_dot(&module, first_dot(&module), &AmxOptions::all()).unwrap();
    assert_eq!(candidate.acc_mode, AccMode::Unlooped);
    assert!(candidate.orig_store.is_none());
    assert!(candidate.out_buf.is_empty());

    let inputs = [
        matrix(16, 16, ElemType::I8, 0),
        matrix(16, 16, ElemType::I8, 1),
        matrix(16, 16, ElemType::I32, 2),
        matrix(16, 16, ElemType::I8, 4),
    ];
    let converted = assert_equivalent(text, "f", &inputs, AmxOptions::all());
    // The tiles are stored to the accumulator buffer and read back at the dot.
    assert_eq!(converted.count_ops("tile_store"), 1);
    // Both original writes stay, next to the accumulator spill and the
    // packing copy.
    assert_eq!(converted.count_ops("write"), 4, "{}", converted);
}

// =============================================================================
// Rejections and properties
// =============================================================================

#[test]
fn test_mixed_int_float_rejected() {
    let text = r#"
func @f(%a: memref<16x16xi8>, %b: memref<16x16xbf16>) {
  %c0 = const 0 : index
  %lhs = read %a[%c0, %c0] : vector<16x16xi8>
  %rhs = read %b[%c0, %c0] : vector<16x16xbf16>
  %acc = const 0.0 : vector<16x16xf32>
  %res = dot %lhs, %rhs, %acc : vector<16x16xf32>
  return %res
}
"#;
    let module = Module::parse(text).unwrap();
    let rejection = analyze_dot(&module, first_dot(&module), &AmxOptions::all()).unwrap_err();
    assert_eq!(rejection, Rejection::MixedIntFloat);
}

#[test]
fn test_all_flags_off_is_noop() {
    init_logging();
    let mut module = Module::parse(INT8_STORE).unwrap();
    let printed = module.print();
    assert_eq!(run_pass(&mut module, AmxOptions::default()), PassReport::default());
    assert_eq!(module.print(), printed);
}

#[test]
fn test_pass_converts_every_candidate() {
    init_logging();
    let text = r#"
func @two(%a: memref<16x16xi8>, %b: memref<16x16xi8>, %c: memref<16x16xi32>, %d: memref<16x16xi32>) {
  %c0 = const 0 : index
  %lhs = read %a[%c0, %c0] : vector<16x16xi8>
  %rhs = read %b[%c0, %c0] : vector<16x16xi8>
  %acc = read %c[%c0, %c0] : vector<16x16xi32>
  %res = dot %lhs, %rhs, %acc : vector<16x16xi32>
  write %res, %c[%c0, %c0]
  %acc2 = read %d[%c0, %c0] : vector<16x16xi32>
  %res2 = dot %rhs, %lhs, %acc2 : vector<16x16xi32>
  write %res2, %d[%c0, %c0]
  return
}
"#;
    let original = Module::parse(text).unwrap();
    let mut converted = original.clone();
    let int8 = AmxOptions { convert_int8: true, ..AmxOptions::default() };
    let report = run_pass(&mut converted, int8);
    assert_eq!(report, PassReport { candidates: 2, converted: 2, failed: 0, rejected: 0 });

    let inputs = [
        matrix(16, 16, ElemType::I8, 0),
        matrix(16, 16, ElemType::I8, 1),
        matrix(16, 16, ElemType::I32, 2),
        matrix(16, 16, ElemType::I32, 3),
    ];
    assert_eq!(execute(&converted, "two", &inputs), execute(&original, "two", &inputs));
}

#[test]
fn test_accepted_candidates_satisfy_tile_limits() {
    let mut accepted = 0;
    for (elem, acc) in [(ElemType::I8, ElemType::I32), (ElemType::BF16, ElemType::F32)] {
        for m in [8, 16, 32, 48, 64, 128] {
            for n in [8, 16, 32, 64] {
                for k in [16, 32, 64, 128] {
                    let text = format!(
                        "func @f(%a: memref<{m}x{k}x{e}>, %b: memref<{k}x{n}x{e}>) {{\n\
                         \x20 %c0 = const 0 : index\n\
                         \x20 %lhs = read %a[%c0, %c0] : vector<{m}x{k}x{e}>\n\
                         \x20 %rhs = read %b[%c0, %c0] : vector<{k}x{n}x{e}>\n\
                         \x20 %acc = const 0 : vector<{m}x{n}x{a}>\n\
                         \x20 %res = dot %lhs, %rhs, %acc : vector<{m}x{n}x{a}>\n\
                         \x20 return %res\n}}\n",
                        e = elem,
                        a = acc,
                    );
                    let module = Module::parse(&text).unwrap();
                    let Ok(c) = analyze_dot(&module, first_dot(&module), &AmxOptions::all()) else {
                        continue;
                    };
                    accepted += 1;
                    assert!(c.tile_m <= MAX_TILE_DIM && c.tile_n <= MAX_TILE_DIM);
                    assert!(c.tile_k * c.lhs_tile_elem_ty.bit_width() as i64 <= TILE_ROW_BITS);
                    assert!(c.tiles_in_block_m * c.tiles_in_block_n <= MAX_ACC_TILES);
                    assert_eq!(m % (c.tile_m * c.tiles_in_block_m), 0);
                    assert_eq!(n % (c.tile_n * c.tiles_in_block_n), 0);
                    assert_eq!(k % c.tile_k, 0);
                }
            }
        }
    }
    assert!(accepted > 0);
}
