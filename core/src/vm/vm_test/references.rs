use super::*;
use crate::rt::{RequestKind, Returns};

fn make_ref(b: &mut BodyBuilder, source: RefSource, mutable: bool) -> u16 {
    let dst = b.reg();
    b.emit(Op::MakeRef { dst, source, mutable });
    dst
}

fn var_op(b: &mut BodyBuilder, r: u16, op: CompoundOp, arg: Option<u16>) -> u16 {
    let dst = b.reg();
    b.emit(Op::VarOp {
        r,
        op,
        arg,
        dst: Some(dst),
    });
    dst
}

#[test]
fn register_references_alias_one_cell() {
    let mut b = BodyBuilder::new("main", 0);
    let local = b.load(1);
    let five = b.load(5);
    let eight = b.load(8);
    let first = make_ref(&mut b, RefSource::Register(local), true);
    let second = make_ref(&mut b, RefSource::Register(local), true);
    let seen_by_second = b.reg();
    let seen_by_first = b.reg();
    b.emit(Op::RefSet { r: first, src: five });
    b.emit(Op::RefGet {
        dst: seen_by_second,
        r: second,
    });
    b.emit(Op::RefSet { r: second, src: eight });
    b.emit(Op::RefGet {
        dst: seen_by_first,
        r: first,
    });
    b.ret(&[first, second, seen_by_second, seen_by_first, local]);

    let mut ctx = context();
    let kind = RequestKind::Invoke {
        callable: Callable::plain(b.build()),
        target: None,
        args: Vec::new(),
        returns: Returns::Tuple,
    };
    let fiber = ctx.start(kind, None);
    let Val::Tuple(items) = ctx.run_blocking(fiber).unwrap() else {
        panic!("expected a tuple");
    };
    let (Val::Ref(first), Val::Ref(second)) = (&items[0], &items[1]) else {
        panic!("expected two references, got {items:?}");
    };
    assert!(!Reference::ptr_eq(first, second));
    assert_eq!(second.kind(), RefKind::RefToRef);
    assert_eq!(&items[2..], &[Val::Int(5), Val::Int(8), Val::Int(8)]);

    // Both handles keep sharing storage once the frame is gone.
    first.set(&mut ctx, Val::Int(3)).unwrap();
    assert_eq!(second.get(&ctx).unwrap(), Val::Int(3));
    second.set(&mut ctx, Val::Int(4)).unwrap();
    assert_eq!(first.get(&ctx).unwrap(), Val::Int(4));
}

#[test]
fn register_reference_outlives_its_frame() {
    // capture(x) returns a Var over its own parameter register
    let mut capture = BodyBuilder::new("capture", 1);
    let cell = make_ref(&mut capture, RefSource::Register(0), true);
    capture.ret(&[cell]);

    let mut ctx = context();
    let result = call(&mut ctx, Callable::plain(capture.build()), vec![Val::Int(7)]).unwrap();
    let Val::Ref(cell) = result else {
        panic!("expected a reference, got {result:?}");
    };
    assert_eq!(cell.kind(), RefKind::Direct);
    assert_eq!(cell.get(&ctx).unwrap(), Val::Int(7));
    cell.set(&mut ctx, Val::Int(8)).unwrap();
    assert_eq!(cell.get(&ctx).unwrap(), Val::Int(8));
    assert_eq!(ctx.live_frames(), 0);
}

#[test]
fn captured_cell_is_incremented_after_return() {
    let mut capture = BodyBuilder::new("capture", 1);
    let cell = make_ref(&mut capture, RefSource::Register(0), true);
    capture.ret(&[cell]);

    let mut b = BodyBuilder::new("main", 0);
    let f = b.load(function(Callable::plain(capture.build())));
    let seven = b.load(7);
    let r = b.reg();
    b.emit(Op::Call {
        func: f,
        args: regs(&[seven]),
        ret: Ret::One(r),
    });
    let bumped = var_op(&mut b, r, CompoundOp::PreInc, None);
    let after = b.reg();
    b.emit(Op::RefGet { dst: after, r });
    b.ret(&[bumped, after]);
    assert_eq!(
        run_body(b.build(), vec![]).unwrap(),
        Val::tuple(vec![Val::Int(8), Val::Int(8)])
    );
}

#[test]
fn read_only_reference_rejects_writes() {
    let mut b = BodyBuilder::new("main", 0);
    let local = b.load(1);
    let two = b.load(2);
    let cell = make_ref(&mut b, RefSource::Register(local), false);
    b.emit(Op::RefSet { r: cell, src: two });
    b.ret(&[local]);
    let err = run_body(b.build(), vec![]).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::ReadOnly);
    assert_eq!(&*err.message, "Ref cannot be assigned");
}

#[test]
fn read_only_reference_rejects_compound_ops() {
    let mut b = BodyBuilder::new("main", 0);
    let one = b.load(1);
    let cell = make_ref(&mut b, RefSource::Direct(Some(one)), false);
    let out = var_op(&mut b, cell, CompoundOp::PostInc, None);
    b.ret(&[out]);
    assert_eq!(run_body(b.build(), vec![]).unwrap_err().kind, ExceptionKind::ReadOnly);
}

#[test]
fn unassigned_direct_cell() {
    let mut b = BodyBuilder::new("main", 0);
    let cell = make_ref(&mut b, RefSource::Direct(None), true);
    let out = b.reg();
    b.emit(Op::RefGet { dst: out, r: cell });
    b.ret(&[out]);
    assert_eq!(
        run_body(b.build(), vec![]).unwrap_err().kind,
        ExceptionKind::UnassignedReference
    );
}

#[test]
fn numeric_compound_ops() {
    let mut b = BodyBuilder::new("main", 0);
    let ten = b.load(10);
    let five = b.load(5);
    let cell = make_ref(&mut b, RefSource::Direct(Some(ten)), true);
    let added = var_op(&mut b, cell, CompoundOp::Assign(BinOp::Add), Some(five));
    let post = var_op(&mut b, cell, CompoundOp::PostInc, None);
    let pre = var_op(&mut b, cell, CompoundOp::PreDec, None);
    let post_dec = var_op(&mut b, cell, CompoundOp::PostDec, None);
    let last = b.reg();
    b.emit(Op::RefGet { dst: last, r: cell });
    b.ret(&[added, post, pre, post_dec, last]);
    assert_eq!(
        run_body(b.build(), vec![]).unwrap(),
        Val::tuple(vec![
            Val::Int(15),
            Val::Int(15),
            Val::Int(15),
            Val::Int(15),
            Val::Int(14)
        ])
    );
}

/// Class `Acc` with field `x` (set to 40 on construction) and a `+=` override
/// returning `this.x + arg`.
fn acc_registry() -> Registry {
    let mut ctor = BodyBuilder::new("Acc", 0);
    let this = ctor.reg();
    let forty = ctor.load(40);
    ctor.emit(Op::LoadThis { dst: this });
    ctor.emit(Op::SetField {
        obj: this,
        field: Arc::from("x"),
        src: forty,
    });
    ctor.ret(&[]);

    let mut plus = BodyBuilder::new("+=", 1);
    let this = plus.reg();
    let x = plus.reg();
    plus.emit(Op::LoadThis { dst: this });
    plus.emit(Op::GetField {
        dst: x,
        obj: this,
        field: Arc::from("x"),
    });
    plus.emit(Op::Arith {
        op: BinOp::Add,
        dst: x,
        l: x,
        r: 0,
    });
    plus.ret(&[x]);

    let class = ClassInfo::builder("Acc")
        .field("x")
        .constructor(ctor.build(), None)
        .method("+=", plus.build())
        .build();
    let mut registry = Registry::new();
    registry.register_class(class).unwrap();
    registry
}

fn new_acc(b: &mut BodyBuilder) -> u16 {
    let obj = b.reg();
    b.emit(Op::New {
        dst: obj,
        class: Arc::from("Acc"),
        args: regs(&[]),
    });
    obj
}

#[test]
fn compound_override_takes_precedence() {
    let mut b = BodyBuilder::new("main", 0);
    let obj = new_acc(&mut b);
    let two = b.load(2);
    let cell = make_ref(&mut b, RefSource::Direct(Some(obj)), true);
    let out = var_op(&mut b, cell, CompoundOp::Assign(BinOp::Add), Some(two));
    let stored = b.reg();
    b.emit(Op::RefGet { dst: stored, r: cell });
    b.ret(&[out, stored]);

    let mut ctx = context_with(acc_registry(), RuntimeConfig::default());
    let result = call(&mut ctx, Callable::plain(b.build()), vec![]).unwrap();
    assert_eq!(result, Val::tuple(vec![Val::Int(42), Val::Int(42)]));
}

#[test]
fn missing_override_falls_back_to_numeric_path() {
    let mut b = BodyBuilder::new("main", 0);
    let obj = new_acc(&mut b);
    let cell = make_ref(&mut b, RefSource::Direct(Some(obj)), true);
    let out = var_op(&mut b, cell, CompoundOp::PreInc, None);
    b.ret(&[out]);

    let mut ctx = context_with(acc_registry(), RuntimeConfig::default());
    let err = call(&mut ctx, Callable::plain(b.build()), vec![]).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::TypeMismatch);
}

#[test]
fn property_reference_post_increment() {
    let mut b = BodyBuilder::new("main", 0);
    let obj = new_acc(&mut b);
    let cell = make_ref(
        &mut b,
        RefSource::Field {
            obj,
            field: Arc::from("x"),
        },
        true,
    );
    let old = var_op(&mut b, cell, CompoundOp::PostInc, None);
    let now = b.reg();
    b.emit(Op::GetField {
        dst: now,
        obj,
        field: Arc::from("x"),
    });
    b.ret(&[old, now]);

    let mut ctx = context_with(acc_registry(), RuntimeConfig::default());
    let result = call(&mut ctx, Callable::plain(b.build()), vec![]).unwrap();
    assert_eq!(result, Val::tuple(vec![Val::Int(40), Val::Int(41)]));
}

#[test]
fn element_reference_writes_through() {
    let mut b = BodyBuilder::new("main", 0);
    let items: Vec<u16> = (1..=3).map(|i| b.load(i as i64)).collect();
    let arr = b.reg();
    b.emit(Op::NewArray {
        dst: arr,
        items: regs(&items),
    });
    let idx = b.load(1);
    let twenty = b.load(20);
    let cell = make_ref(&mut b, RefSource::Element { arr, idx }, true);
    b.emit(Op::RefSet { r: cell, src: twenty });
    let out = b.reg();
    b.emit(Op::GetElem { dst: out, arr, idx });
    b.ret(&[out]);
    assert_eq!(run_body(b.build(), vec![]).unwrap(), Val::Int(20));
}

#[test]
fn alias_of_alias_shares_storage() {
    let mut ctx = context();
    let base = Reference::direct(ctx.id(), Some(Val::Int(1)), true);
    let alias = Reference::alias(&base, true);
    let deeper = Reference::alias(&alias, false);
    assert_eq!(alias.kind(), RefKind::RefToRef);

    alias.set(&mut ctx, Val::Int(2)).unwrap();
    assert_eq!(deeper.get(&ctx).unwrap(), Val::Int(2));
    assert_eq!(deeper.set(&mut ctx, Val::Int(3)).unwrap_err().kind, ExceptionKind::ReadOnly);
    assert!(!Reference::ptr_eq(&base, &alias));
}

#[test]
fn property_reference_from_another_context() {
    let mut owner = context();
    let other = owner.detached_sibling();
    let class = ClassInfo::builder("Point").field("x").build();
    let obj = owner.alloc(class);
    owner.write_field(&obj, 0, Val::Int(1)).unwrap();

    let cell = Reference::property(owner.id(), obj, 0, true);
    assert_eq!(cell.get(&owner).unwrap(), Val::Int(1));
    assert_eq!(cell.get(&other).unwrap_err().kind, ExceptionKind::CrossContext);
    assert_ne!(owner.id(), other.id());
}

#[test]
fn context_ids_are_numbered_per_runtime() {
    let first = context();
    let second = context();
    assert_eq!(first.id(), second.id());

    let sibling = first.detached_sibling();
    assert_eq!(sibling.id().0, first.id().0 + 1);
    assert_eq!(first.detached_sibling().id().0, first.id().0 + 2);
}
