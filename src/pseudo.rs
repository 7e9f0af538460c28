use crate::error::AtmarkError;
use crate::evaluator::Bindings;
use crate::interp::Interpreter;
use crate::stream::{
    BufferedStage, FilterStage, LineBufferedStage, MaximallyBufferedStage, NullStage,
    SizeBufferedStage, TranslateStage,
};
use crate::value::Value;

/// An operation of the reserved pseudo-module binding.  The capability
/// set is a fixed, enumerable table; attribute access on the pseudo-module
/// resolves against it and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoOp {
    Identify,
    AtExit,
    SetContextName,
    SetContextLine,
    Defined,
    Evaluate,
    Execute,
    Significate,
    Include,
    Expand,
    Quote,
    Escape,
    Flush,
    GetPrefix,
    SetPrefix,
    StopDiverting,
    CreateDiversion,
    StartDiversion,
    PlayDiversion,
    ReplayDiversion,
    PurgeDiversion,
    PlayAllDiversions,
    ReplayAllDiversions,
    PurgeAllDiversions,
    GetCurrentDiversion,
    GetAllDiversions,
    ResetFilter,
    NullFilter,
    SetFilter,
    AttachFilter,
    EnableHooks,
    DisableHooks,
    AreHooksEnabled,
    InvokeHook,
}

pub const PSEUDO_TABLE: &[(&str, PseudoOp)] = &[
    ("identify", PseudoOp::Identify),
    ("at_exit", PseudoOp::AtExit),
    ("set_context_name", PseudoOp::SetContextName),
    ("set_context_line", PseudoOp::SetContextLine),
    ("defined", PseudoOp::Defined),
    ("evaluate", PseudoOp::Evaluate),
    ("execute", PseudoOp::Execute),
    ("significate", PseudoOp::Significate),
    ("include", PseudoOp::Include),
    ("expand", PseudoOp::Expand),
    ("quote", PseudoOp::Quote),
    ("escape", PseudoOp::Escape),
    ("flush", PseudoOp::Flush),
    ("get_prefix", PseudoOp::GetPrefix),
    ("set_prefix", PseudoOp::SetPrefix),
    ("stop_diverting", PseudoOp::StopDiverting),
    ("create_diversion", PseudoOp::CreateDiversion),
    ("start_diversion", PseudoOp::StartDiversion),
    ("play_diversion", PseudoOp::PlayDiversion),
    ("replay_diversion", PseudoOp::ReplayDiversion),
    ("purge_diversion", PseudoOp::PurgeDiversion),
    ("play_all_diversions", PseudoOp::PlayAllDiversions),
    ("replay_all_diversions", PseudoOp::ReplayAllDiversions),
    ("purge_all_diversions", PseudoOp::PurgeAllDiversions),
    ("get_current_diversion", PseudoOp::GetCurrentDiversion),
    ("get_all_diversions", PseudoOp::GetAllDiversions),
    ("reset_filter", PseudoOp::ResetFilter),
    ("null_filter", PseudoOp::NullFilter),
    ("set_filter", PseudoOp::SetFilter),
    ("attach_filter", PseudoOp::AttachFilter),
    ("enable_hooks", PseudoOp::EnableHooks),
    ("disable_hooks", PseudoOp::DisableHooks),
    ("are_hooks_enabled", PseudoOp::AreHooksEnabled),
    ("invoke_hook", PseudoOp::InvokeHook),
];

impl PseudoOp {
    pub fn name(self) -> &'static str {
        PSEUDO_TABLE
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }
}

pub fn lookup(name: &str) -> Option<PseudoOp> {
    PSEUDO_TABLE
        .iter()
        .find(|(entry, _)| *entry == name)
        .map(|(_, op)| *op)
}

fn string_arg<'a>(op: PseudoOp, args: &'a [Value], index: usize) -> Result<&'a str, AtmarkError> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(AtmarkError::eval(format!(
            "{}() argument {} must be a string, got {}",
            op.name(),
            index + 1,
            other.type_name()
        ))),
        None => Err(AtmarkError::eval(format!(
            "{}() missing argument {}",
            op.name(),
            index + 1
        ))),
    }
}

fn int_arg(op: PseudoOp, args: &[Value], index: usize) -> Result<i64, AtmarkError> {
    match args.get(index) {
        Some(Value::Int(n)) => Ok(*n),
        Some(other) => Err(AtmarkError::eval(format!(
            "{}() argument {} must be an int, got {}",
            op.name(),
            index + 1,
            other.type_name()
        ))),
        None => Err(AtmarkError::eval(format!(
            "{}() missing argument {}",
            op.name(),
            index + 1
        ))),
    }
}

/// Dispatch one pseudo-module operation against the interpreter.
pub fn call(
    op: PseudoOp,
    args: Vec<Value>,
    interp: &mut Interpreter,
    locals: Option<&mut Bindings>,
) -> Result<Value, AtmarkError> {
    match op {
        PseudoOp::Identify => {
            let context = interp.context()?;
            Ok(Value::List(vec![
                Value::String(context.name.clone()),
                Value::Int(context.line as i64),
            ]))
        }
        PseudoOp::AtExit => {
            let callable = args
                .into_iter()
                .next()
                .ok_or_else(|| AtmarkError::eval("at_exit() missing argument 1"))?;
            interp.at_exit(callable)?;
            Ok(Value::Nil)
        }
        PseudoOp::SetContextName => {
            let name = string_arg(op, &args, 0)?.to_string();
            interp.context_mut()?.name = name;
            Ok(Value::Nil)
        }
        PseudoOp::SetContextLine => {
            let line = int_arg(op, &args, 0)?;
            if line < 0 {
                return Err(AtmarkError::eval("set_context_line() requires line >= 0"));
            }
            interp.context_mut()?.line = line as usize;
            Ok(Value::Nil)
        }
        PseudoOp::Defined => {
            let name = string_arg(op, &args, 0)?;
            Ok(Value::Bool(interp.defined(name, locals.as_deref())))
        }
        PseudoOp::Evaluate => {
            let code = string_arg(op, &args, 0)?.to_string();
            interp.evaluate(&code, locals)
        }
        PseudoOp::Execute => {
            let code = string_arg(op, &args, 0)?.to_string();
            interp.execute(&code, locals)?;
            Ok(Value::Nil)
        }
        PseudoOp::Significate => {
            let key = string_arg(op, &args, 0)?.to_string();
            let value = args.get(1).cloned().unwrap_or(Value::Nil);
            interp.significate(&key, value, locals)?;
            Ok(Value::Nil)
        }
        PseudoOp::Include => {
            let filename = string_arg(op, &args, 0)?.to_string();
            interp.include(&filename, locals)?;
            Ok(Value::Nil)
        }
        PseudoOp::Expand => {
            let data = string_arg(op, &args, 0)?.to_string();
            let expansion = interp.expand(&data, locals)?;
            Ok(Value::String(expansion))
        }
        PseudoOp::Quote => {
            let data = string_arg(op, &args, 0)?.to_string();
            Ok(Value::String(interp.quote(&data)))
        }
        PseudoOp::Escape => {
            let data = string_arg(op, &args, 0)?.to_string();
            let more = match args.get(1) {
                Some(Value::String(more)) => more.clone(),
                _ => String::new(),
            };
            Ok(Value::String(interp.escape(&data, &more)))
        }
        PseudoOp::Flush => {
            interp.flush()?;
            Ok(Value::Nil)
        }
        PseudoOp::GetPrefix => Ok(Value::String(interp.prefix().to_string())),
        PseudoOp::SetPrefix => {
            let prefix = string_arg(op, &args, 0)?;
            let mut chars = prefix.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => {
                    interp.set_prefix(c);
                    Ok(Value::Nil)
                }
                _ => Err(AtmarkError::eval(
                    "prefix must be a single-character string",
                )),
            }
        }
        PseudoOp::StopDiverting => {
            interp.stream_mut()?.revert();
            Ok(Value::Nil)
        }
        PseudoOp::CreateDiversion => {
            let name = string_arg(op, &args, 0)?.to_string();
            interp.stream_mut()?.create(&name)?;
            Ok(Value::Nil)
        }
        PseudoOp::StartDiversion => {
            let name = string_arg(op, &args, 0)?.to_string();
            interp.stream_mut()?.divert(&name)?;
            Ok(Value::Nil)
        }
        PseudoOp::PlayDiversion => {
            let name = string_arg(op, &args, 0)?.to_string();
            interp.stream_mut()?.undivert(&name, true)?;
            Ok(Value::Nil)
        }
        PseudoOp::ReplayDiversion => {
            let name = string_arg(op, &args, 0)?.to_string();
            interp.stream_mut()?.undivert(&name, false)?;
            Ok(Value::Nil)
        }
        PseudoOp::PurgeDiversion => {
            let name = string_arg(op, &args, 0)?.to_string();
            interp.stream_mut()?.purge(&name);
            Ok(Value::Nil)
        }
        PseudoOp::PlayAllDiversions => {
            interp.stream_mut()?.undivert_all(true)?;
            Ok(Value::Nil)
        }
        PseudoOp::ReplayAllDiversions => {
            interp.stream_mut()?.undivert_all(false)?;
            Ok(Value::Nil)
        }
        PseudoOp::PurgeAllDiversions => {
            interp.stream_mut()?.purge_all();
            Ok(Value::Nil)
        }
        PseudoOp::GetCurrentDiversion => Ok(match interp.stream_mut()?.current_diversion() {
            Some(name) => Value::String(name.to_string()),
            None => Value::Nil,
        }),
        PseudoOp::GetAllDiversions => Ok(Value::List(
            interp
                .stream_mut()?
                .diversion_names()
                .into_iter()
                .map(Value::String)
                .collect(),
        )),
        PseudoOp::ResetFilter => {
            interp.stream_mut()?.install(Vec::new())?;
            Ok(Value::Nil)
        }
        PseudoOp::NullFilter => {
            interp.stream_mut()?.install(vec![Box::new(NullStage)])?;
            Ok(Value::Nil)
        }
        PseudoOp::SetFilter => {
            let spec = args
                .into_iter()
                .next()
                .ok_or_else(|| AtmarkError::eval("set_filter() missing argument 1"))?;
            let stages = normalize_filter(&spec)?;
            interp.stream_mut()?.install(stages)?;
            Ok(Value::Nil)
        }
        PseudoOp::AttachFilter => {
            let spec = args
                .into_iter()
                .next()
                .ok_or_else(|| AtmarkError::eval("attach_filter() missing argument 1"))?;
            let stages = normalize_filter(&spec)?;
            let stream = interp.stream_mut()?;
            for stage in stages {
                stream.attach(stage);
            }
            Ok(Value::Nil)
        }
        PseudoOp::EnableHooks => {
            interp.enable_hooks();
            Ok(Value::Nil)
        }
        PseudoOp::DisableHooks => {
            interp.disable_hooks();
            Ok(Value::Nil)
        }
        PseudoOp::AreHooksEnabled => Ok(Value::Bool(interp.are_hooks_enabled())),
        PseudoOp::InvokeHook => {
            let name = string_arg(op, &args, 0)?.to_string();
            interp.invoke_hook_by_name(&name)?;
            Ok(Value::Nil)
        }
    }
}

/// Normalize a filter shortcut into a chain of stages.
///
/// nil resets to no filter; `0` is the null filter; a 256-character
/// string is a translation table; `"null"`, `"line"`, and `"maximal"`
/// name buffering stages; `["size", n]` is a size-buffering stage; any
/// other list chains its elements in order.
pub fn normalize_filter(spec: &Value) -> Result<Vec<Box<dyn FilterStage>>, AtmarkError> {
    match spec {
        Value::Nil => Ok(Vec::new()),
        Value::Int(0) => Ok(vec![Box::new(NullStage)]),
        Value::String(name) => {
            if name.chars().count() == 256 {
                return Ok(vec![Box::new(TranslateStage::new(name)?)]);
            }
            match name.as_str() {
                "null" => Ok(vec![Box::new(NullStage)]),
                "buffered" => Ok(vec![Box::new(BufferedStage::new())]),
                "line" => Ok(vec![Box::new(LineBufferedStage::new())]),
                "maximal" => Ok(vec![Box::new(MaximallyBufferedStage::new())]),
                other => Err(AtmarkError::filter(format!(
                    "unknown filter shortcut: '{}'",
                    other
                ))),
            }
        }
        Value::List(items) => {
            if items.len() == 2 {
                if let (Value::String(kind), Value::Int(size)) = (&items[0], &items[1]) {
                    if kind == "size" {
                        if *size <= 0 {
                            return Err(AtmarkError::filter("buffer size must be positive"));
                        }
                        return Ok(vec![Box::new(SizeBufferedStage::new(*size as usize)?)]);
                    }
                }
            }
            let mut stages = Vec::new();
            for item in items {
                stages.extend(normalize_filter(item)?);
            }
            Ok(stages)
        }
        other => Err(AtmarkError::filter(format!(
            "cannot use {} as a filter",
            other.type_name()
        ))),
    }
}
