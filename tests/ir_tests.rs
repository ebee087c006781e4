//! Integration tests for the IR: text form, verification, rewriting and
//! interpretation through the public API.

use amx_legalize::ir::{
    Buffer, ConstAttr, ElemType, InsertPoint, Interpreter, Module, OpKind, Rewriter, RtValue, Type,
};
use amx_legalize::IrError;

const ACCUMULATE: &str = r#"
; Sum four rows of %m into one vector.
func @rows(%m: memref<4x8xf32>, %out: memref<1x8xf32>) {
  %c0 = const 0 : index
  %c1 = const 1 : index
  %c4 = const 4 : index
  %zero = const 0.0 : vector<1x8xf32>
  %ones = const 1.0 : vector<8x8xf32>
  %sum = for %i = %c0 to %c4 step %c1 iter(%acc = %zero : vector<1x8xf32>) {
    %row = read %m[%i, %c0] : vector<1x8xf32>
    %next = dot %row, %ones, %acc : vector<1x8xf32>
    yield %next
  }
  write %sum, %out[%c0, %c0]
  return
}
"#;

#[test]
fn test_print_parse_fixpoint() {
    let module = Module::parse(ACCUMULATE).unwrap();
    let printed = module.print();
    let reparsed = Module::parse(&printed).unwrap();
    assert_eq!(reparsed.print(), printed);
    assert!(printed.contains("iter(%acc = %zero : vector<1x8xf32>)"));
}

#[test]
fn test_interpret_loop() {
    let module = Module::parse(ACCUMULATE).unwrap();
    let mut interp = Interpreter::new(&module);
    let m = interp.add_buffer(Buffer::from_fn(4, 8, ElemType::F32, |r, c| (r * 8 + c) as f64));
    let out = interp.add_buffer(Buffer::zeros([1, 8], ElemType::F32));
    interp.run("rows", &[m, out.clone()]).unwrap();

    // Each dot adds the row sum to every lane; four rows sum to 0..32.
    let total: f64 = (0..32).map(|v| v as f64).sum();
    assert!(interp.buffer(&out).unwrap().data.iter().all(|&v| v == total));
}

#[test]
fn test_parse_errors_report_position() {
    let err = Module::parse("func @f() {\n  %x = bogus : index\n  return\n}\n").unwrap_err();
    let IrError::Parse { pos, .. } = err else {
        panic!("expected a parse error, got {:?}", err);
    };
    assert!(pos > 0);

    let undefined = Module::parse("func @f() {\n  return %nope\n}\n");
    assert!(matches!(undefined, Err(IrError::Parse { .. })));
}

#[test]
fn test_build_with_rewriter() {
    let mut module = Module::new();
    let func = module.add_func("build", vec![Type::memref([16, 16], ElemType::BF16)]);
    let body = module.func_body(func);
    let mem = module.func_args(func)[0];

    let mut rw = Rewriter::new(&mut module, InsertPoint::End(body));
    let zero = rw.index_const(0);
    let tile = rw.tile_load(Type::tile([16, 16], ElemType::BF16), mem, &[zero, zero]);
    rw.tile_store(tile, mem, &[zero, zero]);
    rw.create(OpKind::Return, Vec::new(), Vec::new());
    assert_eq!(rw.tile_ops_created(), 2);

    module.verify().unwrap();
    let printed = module.print();
    assert!(printed.contains("tile_load"));
    assert!(printed.contains(": tile<16x16xbf16>"));
    Module::parse(&printed).unwrap();
}

#[test]
fn test_erase_after_replacing_uses() {
    let mut module = Module::parse(ACCUMULATE).unwrap();
    let ones = module
        .walk()
        .into_iter()
        .find(|&op| module.op(op).kind == OpKind::Constant(ConstAttr::Float(1.0)))
        .unwrap();
    let result = module.op(ones).results[0];

    let mut rw = Rewriter::before(&mut module, ones);
    assert!(matches!(rw.erase_op(ones), Err(IrError::EraseWithUses { uses: 1, .. })));
    let replacement = rw.constant(ConstAttr::Float(1.0), Type::vector([8, 8], ElemType::F32));
    rw.replace_all_uses_with(result, replacement);
    rw.erase_op(ones).unwrap();

    module.verify().unwrap();
    assert!(module.op(ones).erased);
}

#[test]
fn test_returned_values() {
    let text = r#"
func @pair(%m: memref<8x8xf32>) {
  %c0 = const 0 : index
  %v = read %m[%c0, %c0] : vector<8x8xf32>
  %w = cast %v : vector<8x8xbf16>
  return %v, %w
}
"#;
    let module = Module::parse(text).unwrap();
    let mut interp = Interpreter::new(&module);
    let fractions = Buffer::from_fn(8, 8, ElemType::F32, |r, c| r as f64 + c as f64 / 1024.0);
    let m = interp.add_buffer(fractions);
    let returned = interp.run("pair", &[m]).unwrap();
    assert_eq!(returned.len(), 2);
    let (RtValue::Vector { data: exact, .. }, RtValue::Vector { data: rounded, .. }) =
        (&returned[0], &returned[1])
    else {
        panic!("expected vectors");
    };
    assert_eq!(exact[1], 1.0 / 1024.0);
    assert_ne!(rounded[9], exact[9]);
}
