use expect_test::expect;
use test_log::test;

use flan_bytecode::inst::Inst;
use flan_bytecode::writer::ImageWriter;
use flan_bytecode::Image;

use crate::error::{RuntimeError, RuntimeErrorKind};
use crate::value::Value;
use crate::vm::Vm;

/// Assemble a body after a two-line error-info table, run it, and return the
/// finished machine for inspection.
fn run(build: impl FnOnce(&mut ImageWriter)) -> Vm {
    let mut vm = prepare(build);
    vm.run().unwrap();
    vm
}

fn run_err(build: impl FnOnce(&mut ImageWriter)) -> (Vm, RuntimeError) {
    let mut vm = prepare(build);
    let err = vm.run().unwrap_err();
    (vm, err)
}

fn prepare(build: impl FnOnce(&mut ImageWriter)) -> Vm {
    let mut w = ImageWriter::new(&[(1, "first line"), (2, "second line")]);
    build(&mut w);
    Vm::new(Image::parse(w.finish()).unwrap())
}

#[test]
fn small_int_loads() {
    let vm = run(|w| {
        for inst in [
            Inst::LoadNeg1,
            Inst::Load0,
            Inst::Load1,
            Inst::Load2,
            Inst::Load3,
            Inst::Load4,
            Inst::Load5,
        ] {
            w.emit(inst);
        }
        w.emit(Inst::Halt);
    });
    assert!(matches!(
        vm.stack(),
        [
            Value::Int(-1),
            Value::Int(0),
            Value::Int(1),
            Value::Int(2),
            Value::Int(3),
            Value::Int(4),
            Value::Int(5),
        ]
    ));
}

#[test]
fn integer_addition() {
    let vm = run(|w| {
        w.emit(Inst::Load2);
        w.emit(Inst::Load3);
        w.emit_blamed(Inst::Add, 0);
        w.emit(Inst::Halt);
    });
    assert!(matches!(vm.stack(), [Value::Int(5)]));
}

#[test]
fn mixed_arithmetic_promotes_to_float() {
    let vm = run(|w| {
        w.emit(Inst::Load2);
        w.emit(Inst::Load).const_float(0.5);
        w.emit_blamed(Inst::Mul, 0);
        w.emit(Inst::Halt);
    });
    assert!(matches!(vm.stack(), [Value::Float(f)] if *f == 1.0));
}

#[test]
fn integer_division_truncates() {
    let vm = run(|w| {
        w.emit(Inst::Load).const_int(7);
        w.emit(Inst::Load2);
        w.emit_blamed(Inst::Div, 0);
        w.emit(Inst::Halt);
    });
    assert!(matches!(vm.stack(), [Value::Int(3)]));
}

#[test]
fn modulo_keeps_the_dividend_sign() {
    let vm = run(|w| {
        w.emit(Inst::Load).const_int(-7);
        w.emit(Inst::Load2);
        w.emit_blamed(Inst::Mod, 0);
        w.emit(Inst::Load).const_float(-7.5);
        w.emit(Inst::Load2);
        w.emit_blamed(Inst::Mod, 0);
        w.emit(Inst::Halt);
    });
    assert!(matches!(
        vm.stack(),
        [Value::Int(-1), Value::Float(f)] if *f == -1.5
    ));
}

#[test]
fn division_by_zero_blames_its_line() {
    let (vm, err) = run_err(|w| {
        w.emit(Inst::Load1);
        w.emit(Inst::Load0);
        w.emit_blamed(Inst::Div, 1);
        w.emit(Inst::Halt);
    });
    assert_eq!(err.kind, RuntimeErrorKind::Domain);
    assert_eq!(err.blame, Some(1));

    let diagnostic = vm.diagnose(&err);
    expect![[r#"
        second line
        Error at line 2: Cannot divide by zero"#]]
    .assert_eq(&diagnostic.to_string());
}

#[test]
fn string_concatenation_allocates_a_new_string() {
    let vm = run(|w| {
        w.emit(Inst::Load).const_str("foo");
        w.emit(Inst::Load).const_str("bar");
        w.emit_blamed(Inst::Add, 0);
        w.emit(Inst::Halt);
    });
    assert_eq!(vm.stack().len(), 1);
    assert_eq!(vm.stack()[0].to_dbg_string(), "'foobar'");
    // "foo", "bar" and the concatenation
    assert_eq!(vm.heap().nursery_count(), 3);
}

#[test]
fn arithmetic_mismatch_names_both_operands() {
    let (_, err) = run_err(|w| {
        w.emit(Inst::Load).const_str("foo");
        w.emit(Inst::Load2);
        w.emit_blamed(Inst::Add, 0);
        w.emit(Inst::Halt);
    });
    assert_eq!(err.kind, RuntimeErrorKind::TypeMismatch);
    assert_eq!(err.message, "Cannot add 'foo' and 2");
}

#[test]
fn empty_is_a_wildcard_in_comparisons() {
    let vm = run(|w| {
        w.emit(Inst::Load).const_empty();
        w.emit(Inst::Load2);
        w.emit_blamed(Inst::Eq, 0);

        w.emit(Inst::Load).const_empty();
        w.emit(Inst::Load2);
        w.emit_blamed(Inst::NEq, 0);

        w.emit(Inst::Load2);
        w.emit(Inst::Load).const_empty();
        w.emit_blamed(Inst::Lt, 0);

        w.emit(Inst::Load).const_empty();
        w.emit(Inst::Load2);
        w.emit_blamed(Inst::GtE, 0);

        w.emit(Inst::Halt);
    });
    assert!(matches!(
        vm.stack(),
        [
            Value::Bool(true),
            Value::Bool(false),
            Value::Bool(true),
            Value::Bool(true),
        ]
    ));
}

#[test]
fn greater_than_is_not_less_or_equal() {
    let vm = run(|w| {
        w.emit(Inst::Load3);
        w.emit(Inst::Load2);
        w.emit_blamed(Inst::Gt, 0);

        w.emit(Inst::Load2);
        w.emit(Inst::Load2);
        w.emit_blamed(Inst::Gt, 0);

        w.emit(Inst::Load2);
        w.emit(Inst::Load2);
        w.emit_blamed(Inst::LtE, 0);

        w.emit(Inst::Halt);
    });
    assert!(matches!(
        vm.stack(),
        [Value::Bool(true), Value::Bool(false), Value::Bool(true)]
    ));
}

#[test]
fn strings_order_lexicographically() {
    let vm = run(|w| {
        w.emit(Inst::Load).const_str("abc");
        w.emit(Inst::Load).const_str("abd");
        w.emit_blamed(Inst::Lt, 0);
        w.emit(Inst::Halt);
    });
    assert!(matches!(vm.stack(), [Value::Bool(true)]));
}

#[test]
fn boolean_connectives_use_truthiness() {
    let vm = run(|w| {
        w.emit(Inst::Load3);
        w.emit(Inst::Load0);
        w.emit(Inst::And);

        w.emit(Inst::Load0);
        w.emit(Inst::Load).const_str("x");
        w.emit(Inst::Or);

        w.emit(Inst::Load0);
        w.emit(Inst::Not);

        w.emit(Inst::Halt);
    });
    assert!(matches!(
        vm.stack(),
        [Value::Bool(false), Value::Bool(true), Value::Bool(true)]
    ));
}

#[test]
fn negate_requires_a_number() {
    let vm = run(|w| {
        w.emit(Inst::Load5);
        w.emit(Inst::Negate);
        w.emit(Inst::Halt);
    });
    assert!(matches!(vm.stack(), [Value::Int(-5)]));

    let (_, err) = run_err(|w| {
        w.emit(Inst::Load).const_str("x");
        w.emit(Inst::Negate);
        w.emit(Inst::Halt);
    });
    assert_eq!(err.kind, RuntimeErrorKind::TypeMismatch);
    assert_eq!(err.blame, None);
}

#[test]
fn stack_shuffling() {
    let vm = run(|w| {
        w.emit(Inst::Load1);
        w.emit(Inst::Load2);
        w.emit(Inst::Nip);

        w.emit(Inst::Load3);
        w.emit(Inst::Load4);
        w.emit(Inst::Load5);
        w.emit(Inst::NipN).u8(2);

        w.emit(Inst::Load4);
        w.emit(Inst::Dup);

        w.emit(Inst::Load0);
        w.emit(Inst::Load0);
        w.emit(Inst::PopN).u8(2);

        w.emit(Inst::Halt);
    });
    assert!(matches!(
        vm.stack(),
        [Value::Int(2), Value::Int(5), Value::Int(4), Value::Int(4)]
    ));
}

#[test]
fn push_decodes_a_run_of_constants() {
    let vm = run(|w| {
        w.emit(Inst::Push).u8(3);
        w.const_int(10).const_bool(true).const_atom("done");
        w.emit(Inst::Halt);
    });
    assert_eq!(vm.stack().len(), 3);
    assert!(matches!(vm.stack()[0], Value::Int(10)));
    assert!(matches!(vm.stack()[1], Value::Bool(true)));
    assert_eq!(vm.stack()[2].to_string(), "done");
}

#[test]
fn forward_jumps() {
    let vm = run(|w| {
        w.emit(Inst::Load1);
        let skip = w.jump(Inst::Jmp);
        w.emit(Inst::Load2);
        w.patch_jump(skip);
        w.emit(Inst::Load3);
        w.emit(Inst::Halt);
    });
    assert!(matches!(vm.stack(), [Value::Int(1), Value::Int(3)]));
}

#[test]
fn conditional_jumps_pop_their_condition() {
    let vm = run(|w| {
        // falsy: Jz taken
        w.emit(Inst::Load0);
        let a = w.jump(Inst::Jz);
        w.emit(Inst::Load1);
        w.patch_jump(a);

        // truthy: Jnz taken
        w.emit(Inst::Load2);
        let b = w.jump(Inst::Jnz);
        w.emit(Inst::Load3);
        w.patch_jump(b);

        w.emit(Inst::Load4);
        w.emit(Inst::Halt);
    });
    assert!(matches!(vm.stack(), [Value::Int(4)]));
}

#[test]
fn lists_preserve_stack_order_and_index_from_both_ends() {
    let vm = run(|w| {
        w.emit(Inst::Load).const_int(10);
        w.emit(Inst::Load).const_int(20);
        w.emit(Inst::Load).const_int(30);
        w.emit(Inst::InitList).u32(3);
        w.emit(Inst::Dup);
        w.emit_blamed(Inst::IdxListOrTup, 0).integer(-1);
        w.emit(Inst::Nip);
        w.emit(Inst::Halt);
    });
    assert!(matches!(vm.stack(), [Value::Int(30)]));

    let vm = run(|w| {
        w.emit(Inst::Load).const_int(10);
        w.emit(Inst::Load).const_int(20);
        w.emit(Inst::Load).const_int(30);
        w.emit(Inst::InitList).u32(3);
        w.emit_blamed(Inst::IdxListOrTup, 0).integer(0);
        w.emit(Inst::Halt);
    });
    assert!(matches!(vm.stack(), [Value::Int(10)]));
}

#[test]
fn list_index_out_of_range_is_blamed() {
    let (_, err) = run_err(|w| {
        w.emit(Inst::Load1);
        w.emit(Inst::InitList).u32(1);
        w.emit_blamed(Inst::IdxListOrTup, 1).integer(5);
        w.emit(Inst::Halt);
    });
    assert_eq!(err.kind, RuntimeErrorKind::Domain);
    assert_eq!(err.message, "Index out of range");
    assert_eq!(err.blame, Some(1));
}

#[test]
fn set_list_assigns_in_place() {
    let vm = run(|w| {
        w.emit(Inst::Load1);
        w.emit(Inst::Load2);
        w.emit(Inst::InitList).u32(2);
        w.emit_blamed(Inst::DefGlobal, 0).short_str("xs");

        w.emit_blamed(Inst::GetGlobal, 0).short_str("xs");
        w.emit(Inst::Load5);
        w.emit_blamed(Inst::SetList, 0).integer(-1);

        w.emit_blamed(Inst::GetGlobal, 0).short_str("xs");
        w.emit_blamed(Inst::IdxListOrTup, 0).integer(1);
        w.emit(Inst::Halt);
    });
    assert!(matches!(vm.stack(), [Value::Int(5)]));
}

#[test]
fn tuples_are_indexable_and_bounded() {
    let vm = run(|w| {
        w.emit(Inst::Load1);
        w.emit(Inst::Load2);
        w.emit(Inst::InitTup).u32(2);
        w.emit_blamed(Inst::IdxListOrTup, 0).integer(1);
        w.emit(Inst::Halt);
    });
    assert!(matches!(vm.stack(), [Value::Int(2)]));

    let (_, err) = run_err(|w| {
        for _ in 0..256 {
            w.emit(Inst::Load0);
        }
        w.emit(Inst::InitTup).u32(256);
        w.emit(Inst::Halt);
    });
    assert_eq!(err.kind, RuntimeErrorKind::Load);
}

#[test]
fn tables_store_and_fetch_members() {
    let vm = run(|w| {
        w.emit(Inst::Load).const_int(1);
        w.emit(Inst::InitTable).u32(1).short_str("a");
        w.emit_blamed(Inst::DefGlobal, 0).short_str("t");

        w.emit_blamed(Inst::GetGlobal, 0).short_str("t");
        w.emit(Inst::Load5);
        w.emit_blamed(Inst::SetMember, 0).short_str("b");

        w.emit_blamed(Inst::GetGlobal, 0).short_str("t");
        w.emit_blamed(Inst::GetMember, 0).short_str("a");
        w.emit_blamed(Inst::GetGlobal, 0).short_str("t");
        w.emit_blamed(Inst::GetMember, 0).short_str("b");
        w.emit(Inst::Halt);
    });
    assert!(matches!(vm.stack(), [Value::Int(1), Value::Int(5)]));
}

#[test]
fn missing_member_aborts() {
    let (_, err) = run_err(|w| {
        w.emit(Inst::Load1);
        w.emit(Inst::InitTable).u32(1).short_str("a");
        w.emit_blamed(Inst::GetMember, 1).short_str("nope");
        w.emit(Inst::Halt);
    });
    assert_eq!(err.kind, RuntimeErrorKind::Domain);
    assert_eq!(err.message, "Table does not have key nope");
}

#[test]
fn member_access_requires_a_table() {
    let (_, err) = run_err(|w| {
        w.emit(Inst::Load5);
        w.emit_blamed(Inst::GetMember, 0).short_str("a");
        w.emit(Inst::Halt);
    });
    assert_eq!(err.kind, RuntimeErrorKind::TypeMismatch);
    assert_eq!(err.message, "Expected a table but got 5");
}

#[test]
fn globals_define_fetch_and_overwrite() {
    let vm = run(|w| {
        w.emit(Inst::Load1);
        w.emit_blamed(Inst::DefGlobal, 0).short_str("x");
        w.emit(Inst::Load2);
        w.emit_blamed(Inst::SetGlobal, 0).short_str("x");
        w.emit_blamed(Inst::GetGlobal, 0).short_str("x");
        w.emit(Inst::Halt);
    });
    assert!(matches!(vm.stack(), [Value::Int(2)]));
    assert!(matches!(
        vm.globals().get("x"),
        Some(Value::Int(2))
    ));
}

#[test]
fn global_redefinition_and_unbound_access_fail() {
    let (_, err) = run_err(|w| {
        w.emit(Inst::Load1);
        w.emit_blamed(Inst::DefGlobal, 0).short_str("x");
        w.emit(Inst::Load2);
        w.emit_blamed(Inst::DefGlobal, 1).short_str("x");
        w.emit(Inst::Halt);
    });
    assert_eq!(err.kind, RuntimeErrorKind::Name);
    assert_eq!(err.message, "Global x is already defined");
    assert_eq!(err.blame, Some(1));

    let (_, err) = run_err(|w| {
        w.emit_blamed(Inst::GetGlobal, 0).short_str("nope");
        w.emit(Inst::Halt);
    });
    assert_eq!(err.kind, RuntimeErrorKind::Name);
    assert_eq!(err.message, "Undefined global nope");

    let (_, err) = run_err(|w| {
        w.emit(Inst::Load1);
        w.emit_blamed(Inst::SetGlobal, 0).short_str("nope");
        w.emit(Inst::Halt);
    });
    assert_eq!(err.kind, RuntimeErrorKind::Name);
}

#[test]
fn locals_resolve_against_the_frame_base() {
    // at the top level `from` is zero, so locals are absolute slots
    let vm = run(|w| {
        w.emit(Inst::Load5);
        w.emit(Inst::Load3);
        w.emit(Inst::GetLocal).u16(0);
        w.emit(Inst::Halt);
    });
    assert!(matches!(
        vm.stack(),
        [Value::Int(5), Value::Int(3), Value::Int(5)]
    ));
}

#[test]
fn set_local_copies_without_popping() {
    let vm = run(|w| {
        w.emit(Inst::Load5);
        w.emit(Inst::Load3);
        w.emit(Inst::Load1);
        w.emit(Inst::SetLocal).u16(0);
        w.emit(Inst::Halt);
    });
    assert!(matches!(
        vm.stack(),
        [Value::Int(1), Value::Int(3), Value::Int(1)]
    ));
}

#[test]
fn calling_a_function_replaces_callee_and_args_with_the_result() {
    let vm = run(|w| {
        w.emit(Inst::Load).const_function("square", 1, |b| {
            b.emit(Inst::GetLocal).u16(0);
            b.emit(Inst::GetLocal).u16(0);
            b.emit_blamed(Inst::Mul, 0);
            b.emit(Inst::RetFn);
        });
        w.emit(Inst::Load).const_int(7);
        w.emit_blamed(Inst::CallFn, 0).u16(1);
        w.emit(Inst::Halt);
    });
    assert!(matches!(vm.stack(), [Value::Int(49)]));
    assert_eq!(vm.call_depth(), 0);
}

#[test]
fn execution_resumes_after_the_call() {
    let vm = run(|w| {
        w.emit(Inst::Load).const_function("inc", 1, |b| {
            b.emit(Inst::GetLocal).u16(0);
            b.emit(Inst::Load1);
            b.emit_blamed(Inst::Add, 0);
            b.emit(Inst::RetFn);
        });
        w.emit(Inst::Load).const_int(41);
        w.emit_blamed(Inst::CallFn, 0).u16(1);
        w.emit(Inst::Load1);
        w.emit_blamed(Inst::Add, 0);
        w.emit(Inst::Halt);
    });
    assert!(matches!(vm.stack(), [Value::Int(43)]));
}

#[test]
fn arity_mismatch_is_a_domain_error() {
    let (_, err) = run_err(|w| {
        w.emit(Inst::Load).const_function("two_args", 2, |b| {
            b.emit(Inst::Load0);
            b.emit(Inst::RetFn);
        });
        w.emit(Inst::Load1);
        w.emit_blamed(Inst::CallFn, 1).u16(1);
        w.emit(Inst::Halt);
    });
    assert_eq!(err.kind, RuntimeErrorKind::Domain);
    assert_eq!(
        err.message,
        "<function two_args> expects 2 arguments but got 1"
    );
}

#[test]
fn calling_a_non_function_is_a_type_error() {
    let (_, err) = run_err(|w| {
        w.emit(Inst::Load5);
        w.emit(Inst::Load1);
        w.emit_blamed(Inst::CallFn, 0).u16(1);
        w.emit(Inst::Halt);
    });
    assert_eq!(err.kind, RuntimeErrorKind::TypeMismatch);
    assert_eq!(err.message, "Cannot call 5");
}

#[test]
fn unbounded_recursion_overflows_the_frame_stack() {
    let (vm, err) = run_err(|w| {
        w.emit(Inst::Load).const_function("loop", 0, |b| {
            b.emit_blamed(Inst::GetGlobal, 0).short_str("loop");
            b.emit_blamed(Inst::CallFn, 0).u16(0);
            b.emit(Inst::RetFn);
        });
        w.emit_blamed(Inst::DefGlobal, 0).short_str("loop");
        w.emit_blamed(Inst::GetGlobal, 0).short_str("loop");
        w.emit_blamed(Inst::CallFn, 0).u16(0);
        w.emit(Inst::Halt);
    });
    assert_eq!(err.kind, RuntimeErrorKind::StackOverflow);
    assert_eq!(vm.call_depth(), vm.config().max_call_frames);
}

#[test]
fn stack_trace_lists_frames_innermost_first() {
    let (vm, err) = run_err(|w| {
        w.emit(Inst::Load).const_function("fails", 0, |b| {
            b.emit(Inst::Load1);
            b.emit(Inst::Load0);
            b.emit_blamed(Inst::Div, 1);
            b.emit(Inst::RetFn);
        });
        w.emit_blamed(Inst::DefGlobal, 0).short_str("fails");

        w.emit(Inst::Load).const_function("outer", 0, |b| {
            b.emit_blamed(Inst::GetGlobal, 0).short_str("fails");
            b.emit_blamed(Inst::CallFn, 0).u16(0);
            b.emit(Inst::RetFn);
        });
        w.emit_blamed(Inst::CallFn, 0).u16(0);
        w.emit(Inst::Halt);
    });

    let diagnostic = vm.diagnose(&err);
    expect![[r#"
        second line
        Error at line 2: Cannot divide by zero
          in fails
          in outer"#]]
    .assert_eq(&diagnostic.to_string());
}

#[test]
fn running_into_a_function_terminator_is_internal() {
    let (_, err) = run_err(|w| {
        w.emit(Inst::Load).const_function("no_ret", 0, |b| {
            b.emit(Inst::Load1);
        });
        w.emit_blamed(Inst::CallFn, 0).u16(0);
        w.emit(Inst::Halt);
    });
    assert_eq!(err.kind, RuntimeErrorKind::Internal);
}

#[test]
fn unknown_opcodes_abort() {
    let (_, err) = run_err(|w| {
        w.u8(0x7B);
    });
    assert_eq!(err.kind, RuntimeErrorKind::Load);
    assert_eq!(err.message, "unknown opcode 0x7B");
}

#[test]
fn debug_rendering_of_composites() {
    let vm = run(|w| {
        w.emit(Inst::Load).const_int(1);
        w.emit(Inst::Load).const_str("two");
        w.emit(Inst::Load).const_atom("ok");
        w.emit(Inst::Load).const_empty();
        w.emit(Inst::InitTup).u32(2);
        w.emit(Inst::InitList).u32(3);
        w.emit(Inst::Halt);
    });
    expect![["[1, 'two', <ok, _>]"]].assert_eq(&vm.stack()[0].to_dbg_string());
    expect![["[1, two, <ok, _>]"]].assert_eq(&vm.stack()[0].to_string());
}

#[test]
fn named_and_anonymous_functions_print_distinctly() {
    let vm = run(|w| {
        w.emit(Inst::Load).const_function("id", 1, |b| {
            b.emit(Inst::GetLocal).u16(0);
            b.emit(Inst::RetFn);
        });
        w.emit(Inst::Load).const_function("", 0, |b| {
            b.emit(Inst::Load0);
            b.emit(Inst::RetFn);
        });
        w.emit(Inst::Halt);
    });
    assert_eq!(vm.stack()[0].to_string(), "<function id>");
    assert!(vm.stack()[1].to_string().starts_with("<function@0x"));
}
