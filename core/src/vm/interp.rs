use crate::val::numeric;
use crate::val::{Exception, ObjectRef, Val};

use super::{Callable, Exec, Guard, MethodBody, Op, Reference, RefSource, Ret, ReturnTo, Step};

impl From<&Ret> for ReturnTo {
    fn from(ret: &Ret) -> Self {
        match ret {
            Ret::Ignore => ReturnTo::Ignore,
            Ret::One(r) => ReturnTo::Register(*r),
            Ret::Tuple(r) => ReturnTo::Tuple(*r),
            Ret::Many(regs) => ReturnTo::Registers(regs.clone()),
        }
    }
}

impl<'a> Exec<'a> {
    pub(crate) fn exec_op(&mut self, op: &Op, body: &MethodBody) -> Step {
        self.exec_op_inner(op, body).unwrap_or_else(|step| step)
    }

    /// Raw register read; futures are returned as is.
    fn reg(&self, r: u16) -> Result<Val, Step> {
        self.frame()?.get(r).cloned().ok_or(Step::Block)
    }

    /// Register read that waits for deferred values.
    fn value(&mut self, r: u16) -> Result<Val, Step> {
        let v = self.reg(r)?;
        self.resolve(v)
    }

    fn args(&self, regs: &[u16]) -> Result<Vec<Val>, Step> {
        regs.iter().map(|r| self.reg(*r)).collect()
    }

    fn set(&mut self, r: u16, v: Val) -> Result<(), Step> {
        self.frame_mut()?.set(r, v);
        Ok(())
    }

    fn function(&mut self, r: u16) -> Result<Callable, Step> {
        match self.value(r)? {
            Val::Function(c) => Ok(c),
            other => Err(Exception::type_mismatch(format!("{} is not callable", other.type_name())).into()),
        }
    }

    fn cell(&mut self, r: u16) -> Result<Reference, Step> {
        match self.value(r)? {
            Val::Ref(cell) => Ok(cell),
            other => Err(Exception::type_mismatch(format!("{} is not a reference", other.type_name())).into()),
        }
    }

    fn object(&mut self, r: u16) -> Result<ObjectRef, Step> {
        match self.value(r)? {
            Val::Object(obj) => Ok(obj),
            Val::Service(svc) if svc.context_id() == self.context_id() => Ok(svc.object().clone()),
            other => Err(Exception::type_mismatch(format!("{} is not a local object", other.type_name())).into()),
        }
    }

    fn index(&mut self, r: u16) -> Result<usize, Step> {
        match self.value(r)? {
            Val::Int(i) if i >= 0 => Ok(i as usize),
            other => Err(Exception::type_mismatch(format!("invalid index {other}")).into()),
        }
    }

    fn field_of(obj: &ObjectRef, name: &str) -> Result<u16, Step> {
        obj.class()
            .field_index(name)
            .ok_or_else(|| Exception::no_such_field(&obj.class().name, name).into())
    }

    fn exec_op_inner(&mut self, op: &Op, body: &MethodBody) -> Result<Step, Step> {
        match op {
            Op::LoadK { dst, k } => {
                let v = body
                    .consts
                    .get(*k as usize)
                    .cloned()
                    .ok_or_else(|| Exception::internal(format!("constant {k} out of range")))?;
                self.set(*dst, v)?;
            }
            Op::Move { dst, src } => {
                let v = self.reg(*src)?;
                self.set(*dst, v)?;
            }
            Op::LoadThis { dst } => {
                let this = self
                    .frame()?
                    .target
                    .clone()
                    .ok_or_else(|| Exception::internal(format!("{} has no receiver", body.name)))?;
                self.set(*dst, this)?;
            }
            Op::Arith { op, dst, l, r } => {
                let a = self.value(*l)?;
                let b = self.value(*r)?;
                let out = numeric::apply(*op, &a, &b)?;
                self.set(*dst, out)?;
            }
            Op::Jmp { to } => self.frame_mut()?.pc = *to,
            Op::JmpIfFalse { cond, to } => {
                if !self.value(*cond)?.is_truthy() {
                    self.frame_mut()?.pc = *to;
                }
            }
            Op::Call { func, args, ret } => {
                let callable = self.function(*func)?;
                let args = self.args(args)?;
                return Ok(callable.invoke(self, None, args, ret.into()));
            }
            Op::Invoke { target, method, args, ret } => {
                let target = self.value(*target)?;
                let args = self.args(args)?;
                return Ok(self.invoke_method(target, method, args, ret.into()));
            }
            Op::CallNext { args, ret } => {
                let args = self.args(args)?;
                return Ok(self.call_next(args, ret.into()));
            }
            Op::New { dst, class, args } => {
                let class = self.class(class)?;
                let args = self.args(args)?;
                let ret = ReturnTo::Register(*dst);
                return Ok(if class.service {
                    self.construct_service(class, args, ret)
                } else {
                    self.construct(class, args, ret)
                });
            }
            Op::NewService { dst, class, args } => {
                let class = self.class(class)?;
                let args = self.args(args)?;
                return Ok(self.construct_service(class, args, ReturnTo::Register(*dst)));
            }
            Op::NewArray { dst, items } => {
                let items = self.args(items)?;
                let class = self.ctx.registry().array_class().clone();
                let array = self.ctx.heap.alloc_array(class, items);
                self.set(*dst, Val::Object(array))?;
            }
            Op::GetField { dst, obj, field } => match self.value(*obj)? {
                Val::Service(svc) if svc.context_id() != self.context_id() => {
                    let idx = Self::field_of(svc.object(), field)?;
                    if svc.object().class().is_atomic(idx) {
                        let v = self.ctx.read_field(svc.object(), idx)?;
                        self.set(*dst, v)?;
                    } else {
                        return Ok(self.send_get_property(&svc, idx, ReturnTo::Register(*dst)));
                    }
                }
                Val::Service(svc) => {
                    let idx = Self::field_of(svc.object(), field)?;
                    let v = self.ctx.read_field(svc.object(), idx)?;
                    self.set(*dst, v)?;
                }
                Val::Object(obj) => {
                    let idx = Self::field_of(&obj, field)?;
                    match self.ctx.peek_field(&obj, idx)? {
                        Some(v) => self.set(*dst, v)?,
                        None => return Err(Step::Block),
                    }
                }
                other => {
                    return Err(Exception::type_mismatch(format!("{} has no fields", other.type_name())).into());
                }
            },
            Op::SetField { obj, field, src } => {
                let value = self.reg(*src)?;
                match self.value(*obj)? {
                    Val::Service(svc) if svc.context_id() != self.context_id() => {
                        let idx = Self::field_of(svc.object(), field)?;
                        if svc.object().class().is_atomic(idx) {
                            self.ctx.write_field(svc.object(), idx, value)?;
                        } else {
                            return Ok(self.send_set_property(&svc, idx, value));
                        }
                    }
                    Val::Service(svc) => {
                        let idx = Self::field_of(svc.object(), field)?;
                        self.ctx.write_field(svc.object(), idx, value)?;
                    }
                    Val::Object(obj) => {
                        let idx = Self::field_of(&obj, field)?;
                        self.ctx.write_field(&obj, idx, value)?;
                    }
                    other => {
                        return Err(Exception::type_mismatch(format!("{} has no fields", other.type_name())).into());
                    }
                }
            }
            Op::GetElem { dst, arr, idx } => {
                let array = self.object(*arr)?;
                let i = self.index(*idx)?;
                let v = self.ctx.heap.element(&array, i)?;
                self.set(*dst, v)?;
            }
            Op::SetElem { arr, idx, src } => {
                let array = self.object(*arr)?;
                let i = self.index(*idx)?;
                let v = self.reg(*src)?;
                self.ctx.heap.set_element(&array, i, v)?;
            }
            Op::MakeRef { dst, source, mutable } => {
                let context = self.context_id();
                let cell = match source {
                    RefSource::Register(r) => {
                        let frame = self.current_id()?;
                        Reference::for_register(self.ctx, frame, *r, *mutable)?
                    }
                    RefSource::Field { obj, field } => {
                        let target = self.object(*obj)?;
                        let idx = Self::field_of(&target, field)?;
                        Reference::property(context, target, idx, *mutable)
                    }
                    RefSource::Element { arr, idx } => {
                        let container = self.object(*arr)?;
                        let i = self.index(*idx)?;
                        Reference::element(context, container, i, *mutable)
                    }
                    RefSource::Direct(src) => {
                        let seed = match src {
                            Some(r) => Some(self.reg(*r)?),
                            None => None,
                        };
                        Reference::direct(context, seed, *mutable)
                    }
                };
                self.set(*dst, Val::Ref(cell))?;
            }
            Op::RefGet { dst, r } => {
                let cell = self.cell(*r)?;
                match cell.peek(self.ctx)? {
                    Some(v) => self.set(*dst, v)?,
                    None => return Err(Step::Block),
                }
            }
            Op::RefSet { r, src } => {
                let cell = self.cell(*r)?;
                let v = self.reg(*src)?;
                cell.set(self.ctx, v)?;
            }
            Op::VarOp { r, op, arg, dst } => {
                let cell = self.cell(*r)?;
                let arg = match arg {
                    Some(a) => Some(self.value(*a)?),
                    None => None,
                };
                let ret = match dst {
                    Some(d) => ReturnTo::Register(*d),
                    None => ReturnTo::Ignore,
                };
                return Ok(self.var_op(cell, *op, arg, ret));
            }
            Op::Bind { dst, func, index, value } => {
                let callable = self.function(*func)?;
                let v = self.reg(*value)?;
                let bound = callable.bind(*index as isize, v)?;
                self.set(*dst, Val::Function(bound))?;
            }
            Op::BindTarget { dst, func, value } => {
                let callable = self.function(*func)?;
                let v = self.reg(*value)?;
                self.set(*dst, Val::Function(callable.bind_target(v)))?;
            }
            Op::Await { dst, src } => {
                let v = self.value(*src)?;
                self.set(*dst, v)?;
            }
            Op::Yield => return Ok(Step::Yield),
            Op::Throw { src } => {
                let e = match self.value(*src)? {
                    Val::Exception(e) => (*e).clone(),
                    other => Exception::user(other.to_string()),
                };
                return Err(Step::Exception(e));
            }
            Op::GuardStart { catch, dst } => self.frame_mut()?.guards.push(Guard {
                catch: *catch,
                dst: *dst,
            }),
            Op::GuardEnd => {
                self.frame_mut()?.guards.pop();
            }
            Op::Return { regs } => {
                let values = self.args(regs)?;
                return Ok(self.return_values(values));
            }
        }
        Ok(Step::Proceed)
    }
}
