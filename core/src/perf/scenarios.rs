use std::sync::Arc;

use anyhow::{Context, Result, bail};

use crate::registry::Registry;
use crate::rt::{Returns, Runtime, RuntimeConfig, RuntimeStats, ServiceHandle};
use crate::val::numeric::BinOp;
use crate::val::{ClassInfo, Val};
use crate::vm::{BodyBuilder, CompoundOp, MethodBody, Op, RefSource, Ret, regs};

pub struct ScenarioOutcome {
    pub value: Val,
    pub stats: RuntimeStats,
}

/// A host-driven workload over the services in [`scenario_registry`].
#[derive(Debug)]
pub struct Scenario {
    key: &'static str,
    title: &'static str,
    expected: i64,
    drive: fn(&Runtime) -> Result<Val>,
}

impl Scenario {
    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn title(&self) -> &'static str {
        self.title
    }

    pub fn expected(&self) -> Val {
        Val::Int(self.expected)
    }

    pub fn bench_case_name(&self) -> String {
        format!("{}_actors", self.key)
    }

    /// Run on a fresh runtime built from `config` and verify the result.
    pub fn run(&self, config: RuntimeConfig) -> Result<ScenarioOutcome> {
        let runtime = Runtime::new(config, Arc::new(scenario_registry()?))?;
        self.run_with(&runtime)
    }

    pub fn run_with(&self, runtime: &Runtime) -> Result<ScenarioOutcome> {
        let value = (self.drive)(runtime).with_context(|| format!("scenario {} failed", self.key))?;
        if value != self.expected() {
            bail!("expected {} but observed {:?}", self.expected, value);
        }
        Ok(ScenarioOutcome {
            value,
            stats: runtime.stats(),
        })
    }
}

static SCENARIOS: &[Scenario] = &[
    Scenario {
        key: "counter",
        title: "Fire-and-forget increments on one service",
        expected: 100 + 5_050,
        drive: drive_counter,
    },
    Scenario {
        key: "pipeline",
        title: "Service awaiting another service in a loop",
        expected: 50 * 49,
        drive: drive_pipeline,
    },
    Scenario {
        key: "finalizers",
        title: "Constructor sequence followed by its finalizer chain",
        expected: 1_234,
        drive: drive_finalizers,
    },
];

pub fn scenarios() -> &'static [Scenario] {
    SCENARIOS
}

pub fn find_scenario(key: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.key == key)
}

fn construct(runtime: &Runtime, class: &str, args: Vec<Val>) -> Result<ServiceHandle> {
    let future = runtime.construct(class, args)?;
    match runtime.wait(&future)? {
        Val::Service(service) => Ok(service),
        other => bail!("constructing {class} produced {}", other.type_name()),
    }
}

fn drive_counter(runtime: &Runtime) -> Result<Val> {
    let counter = construct(runtime, "Counter", vec![Val::Int(100)])?;
    for n in 1..=100 {
        runtime.invoke(&counter, "add", vec![Val::Int(n)], Returns::None)?;
    }
    let total = runtime.call(&counter, "get", Vec::new())?;
    let hits = runtime.wait(&runtime.get_property(&counter, "hits")?)?;
    if hits != Val::Int(100) {
        bail!("counter saw {hits} hits");
    }
    Ok(total)
}

fn drive_pipeline(runtime: &Runtime) -> Result<Val> {
    let doubler = construct(runtime, "Doubler", Vec::new())?;
    let summer = construct(runtime, "Summer", Vec::new())?;
    runtime.call(&summer, "sum_doubled", vec![Val::Service(doubler), Val::Int(50)])
}

fn drive_finalizers(runtime: &Runtime) -> Result<Val> {
    let witness = construct(runtime, "FinalizerWitness", Vec::new())?;
    runtime.call(&witness, "order", Vec::new())
}

/// Registry holding every class the scenarios use.
pub fn scenario_registry() -> Result<Registry> {
    let mut registry = Registry::new();
    registry.register_class(counter_class())?;
    registry.register_class(doubler_class())?;
    registry.register_class(summer_class())?;
    let base = ordered_base_class();
    registry.register_class(finalizer_witness_class(base.clone()))?;
    registry.register_class(base)?;
    Ok(registry)
}

fn getter(name: &str, field: &str) -> Arc<MethodBody> {
    let mut b = BodyBuilder::new(name, 0);
    let this = b.reg();
    let out = b.reg();
    b.emit(Op::LoadThis { dst: this });
    b.emit(Op::GetField {
        dst: out,
        obj: this,
        field: Arc::from(field),
    });
    b.ret(&[out]);
    b.build()
}

fn counter_class() -> Arc<ClassInfo> {
    let mut ctor = BodyBuilder::new("Counter", 1);
    let this = ctor.reg();
    ctor.emit(Op::LoadThis { dst: this });
    ctor.emit(Op::SetField {
        obj: this,
        field: Arc::from("count"),
        src: 0,
    });
    let zero = ctor.load(0);
    ctor.emit(Op::SetField {
        obj: this,
        field: Arc::from("hits"),
        src: zero,
    });
    ctor.ret(&[]);

    let mut add = BodyBuilder::new("add", 1);
    let this = add.reg();
    let count = add.reg();
    let hits = add.reg();
    let out = add.reg();
    add.emit(Op::LoadThis { dst: this });
    add.emit(Op::MakeRef {
        dst: count,
        source: RefSource::Field {
            obj: this,
            field: Arc::from("count"),
        },
        mutable: true,
    });
    add.emit(Op::VarOp {
        r: count,
        op: CompoundOp::Assign(BinOp::Add),
        arg: Some(0),
        dst: Some(out),
    });
    add.emit(Op::MakeRef {
        dst: hits,
        source: RefSource::Field {
            obj: this,
            field: Arc::from("hits"),
        },
        mutable: true,
    });
    add.emit(Op::VarOp {
        r: hits,
        op: CompoundOp::PostInc,
        arg: None,
        dst: None,
    });
    add.ret(&[out]);

    ClassInfo::builder("Counter")
        .service()
        .field("count")
        .atomic_field("hits")
        .constructor(ctor.build(), None)
        .method("add", add.build())
        .method("get", getter("get", "count"))
        .build()
}

fn doubler_class() -> Arc<ClassInfo> {
    let mut double = BodyBuilder::new("double", 1);
    let two = double.load(2);
    let out = double.reg();
    double.emit(Op::Arith {
        op: BinOp::Mul,
        dst: out,
        l: 0,
        r: two,
    });
    double.ret(&[out]);

    ClassInfo::builder("Doubler")
        .service()
        .method("double", double.build())
        .build()
}

fn summer_class() -> Arc<ClassInfo> {
    // sum_doubled(doubler, n): sum of doubler.double(i) for i in 0..n
    let mut b = BodyBuilder::new("sum_doubled", 2);
    let acc = b.load(0);
    let i = b.load(0);
    let one = b.load(1);
    let cond = b.reg();
    let part = b.reg();
    let top = b.pos();
    b.emit(Op::Arith {
        op: BinOp::Lt,
        dst: cond,
        l: i,
        r: 1,
    });
    let exit = b.emit(Op::JmpIfFalse { cond, to: 0 });
    b.emit(Op::Invoke {
        target: 0,
        method: Arc::from("double"),
        args: regs(&[i]),
        ret: Ret::One(part),
    });
    b.emit(Op::Arith {
        op: BinOp::Add,
        dst: acc,
        l: acc,
        r: part,
    });
    b.emit(Op::Arith {
        op: BinOp::Add,
        dst: i,
        l: i,
        r: one,
    });
    b.emit(Op::Jmp { to: top });
    let end = b.pos();
    b.patch(exit, end);
    b.ret(&[acc]);

    ClassInfo::builder("Summer")
        .service()
        .method("sum_doubled", b.build())
        .build()
}

/// `order = order * 10 + digit`
fn append_digit(name: &str, digit: i64) -> Arc<MethodBody> {
    let mut b = BodyBuilder::new(name, 0);
    let this = b.reg();
    let cur = b.reg();
    let ten = b.load(10);
    let d = b.load(digit);
    b.emit(Op::LoadThis { dst: this });
    b.emit(Op::GetField {
        dst: cur,
        obj: this,
        field: Arc::from("order"),
    });
    b.emit(Op::Arith {
        op: BinOp::Mul,
        dst: cur,
        l: cur,
        r: ten,
    });
    b.emit(Op::Arith {
        op: BinOp::Add,
        dst: cur,
        l: cur,
        r: d,
    });
    b.emit(Op::SetField {
        obj: this,
        field: Arc::from("order"),
        src: cur,
    });
    b.ret(&[]);
    b.build()
}

fn ordered_base_class() -> Arc<ClassInfo> {
    let mut ctor = BodyBuilder::new("OrderedBase", 0);
    let this = ctor.reg();
    let first = ctor.load(1);
    ctor.emit(Op::LoadThis { dst: this });
    ctor.emit(Op::SetField {
        obj: this,
        field: Arc::from("order"),
        src: first,
    });
    ctor.ret(&[]);

    ClassInfo::builder("OrderedBase")
        .field("order")
        .constructor(ctor.build(), Some(append_digit("OrderedBase.finally", 3)))
        .method("order", getter("order", "order"))
        .build()
}

fn finalizer_witness_class(base: Arc<ClassInfo>) -> Arc<ClassInfo> {
    ClassInfo::builder("FinalizerWitness")
        .extends(base)
        .service()
        .constructor(append_digit("FinalizerWitness", 2), Some(append_digit("FinalizerWitness.finally", 4)))
        .build()
}
