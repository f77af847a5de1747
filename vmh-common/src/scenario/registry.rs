//! Structured step calls and the registry that dispatches them.

use super::context::ScenarioContext;
use crate::errors::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// A step parameter value as written in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepArg {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl StepArg {
    fn kind(&self) -> ParamKind {
        match self {
            Self::Bool(_) => ParamKind::Bool,
            Self::Int(_) => ParamKind::Int,
            Self::Str(_) => ParamKind::Str,
        }
    }
}

impl From<bool> for StepArg {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for StepArg {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for StepArg {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for StepArg {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for StepArg {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for StepArg {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl fmt::Display for StepArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// One step invocation: a verb and named arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCall {
    pub verb: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, StepArg>,
}

impl StepCall {
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            args: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<StepArg>) -> Self {
        self.args.insert(name.to_string(), value.into());
        self
    }
}

impl fmt::Display for StepCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.verb)?;
        for (name, value) in &self.args {
            write!(f, " {name}={value}")?;
        }
        Ok(())
    }
}

/// Typed view on a call's arguments.
#[derive(Debug, Clone, Copy)]
pub struct StepArgs<'a> {
    verb: &'a str,
    args: &'a BTreeMap<String, StepArg>,
}

impl<'a> StepArgs<'a> {
    pub fn new(call: &'a StepCall) -> Self {
        Self {
            verb: &call.verb,
            args: &call.args,
        }
    }

    /// No arguments at all; every optional parameter takes its default.
    pub fn empty() -> StepArgs<'static> {
        static NONE: BTreeMap<String, StepArg> = BTreeMap::new();
        StepArgs {
            verb: "",
            args: &NONE,
        }
    }

    fn missing(&self, name: &str) -> HarnessError {
        HarnessError::usage(format!("step '{}' needs parameter '{name}'", self.verb))
    }

    fn mistyped(&self, name: &str, expected: &str, got: &StepArg) -> HarnessError {
        HarnessError::usage(format!(
            "step '{}': parameter '{name}' must be {expected}, got {got}",
            self.verb
        ))
    }

    pub fn str(&self, name: &str) -> HarnessResult<&'a str> {
        self.opt_str(name)?.ok_or_else(|| self.missing(name))
    }

    pub fn opt_str(&self, name: &str) -> HarnessResult<Option<&'a str>> {
        match self.args.get(name) {
            None => Ok(None),
            Some(StepArg::Str(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(self.mistyped(name, "a string", other)),
        }
    }

    pub fn u64(&self, name: &str) -> HarnessResult<u64> {
        self.opt_u64(name)?.ok_or_else(|| self.missing(name))
    }

    pub fn opt_u64(&self, name: &str) -> HarnessResult<Option<u64>> {
        match self.args.get(name) {
            None => Ok(None),
            Some(StepArg::Int(i)) => u64::try_from(*i)
                .map(Some)
                .map_err(|_| self.mistyped(name, "a non-negative integer", &StepArg::Int(*i))),
            Some(other) => Err(self.mistyped(name, "an integer", other)),
        }
    }

    /// Boolean flag; absent means `false`.
    pub fn bool(&self, name: &str) -> HarnessResult<bool> {
        match self.args.get(name) {
            None => Ok(false),
            Some(StepArg::Bool(b)) => Ok(*b),
            Some(other) => Err(self.mistyped(name, "a boolean", other)),
        }
    }

    /// Integer seconds, or a humantime string such as `"90s"` or `"2m"`.
    pub fn duration(&self, name: &str) -> HarnessResult<Duration> {
        self.opt_duration(name)?.ok_or_else(|| self.missing(name))
    }

    pub fn opt_duration(&self, name: &str) -> HarnessResult<Option<Duration>> {
        match self.args.get(name) {
            None => Ok(None),
            Some(StepArg::Int(i)) => u64::try_from(*i)
                .map(|secs| Some(Duration::from_secs(secs)))
                .map_err(|_| self.mistyped(name, "a non-negative duration", &StepArg::Int(*i))),
            Some(StepArg::Str(s)) => humantime::parse_duration(s)
                .map(Some)
                .map_err(|e| self.mistyped(name, &format!("a duration ({e})"), &StepArg::Str(s.clone()))),
            Some(other) => Err(self.mistyped(name, "a duration", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Str,
    Int,
    Bool,
    /// Integer seconds or a humantime string.
    Duration,
}

impl ParamKind {
    fn accepts(self, arg: &StepArg) -> bool {
        match self {
            Self::Duration => matches!(arg, StepArg::Int(_) | StepArg::Str(_)),
            kind => kind == arg.kind(),
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Str => "string",
            Self::Int => "integer",
            Self::Bool => "boolean",
            Self::Duration => "duration",
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Param {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

impl Param {
    pub const fn required(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

pub type StepHandler = fn(&mut ScenarioContext, &StepArgs<'_>) -> HarnessResult<()>;

/// A registered step.
#[derive(Clone, Serialize)]
pub struct StepDefinition {
    pub verb: &'static str,
    pub summary: &'static str,
    pub params: &'static [Param],
    #[serde(skip)]
    pub handler: StepHandler,
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("verb", &self.verb)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// A step that failed plan validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanIssue {
    pub index: usize,
    pub verb: String,
    pub message: String,
}

impl fmt::Display for PlanIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} ({}): {}", self.index + 1, self.verb, self.message)
    }
}

#[derive(Debug, Default, Clone)]
pub struct StepRegistry {
    steps: BTreeMap<&'static str, StepDefinition>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in step library.
    pub fn with_builtin_steps() -> Self {
        let mut registry = Self::new();
        for definition in super::steps::builtin_steps() {
            registry.steps.insert(definition.verb, definition);
        }
        registry
    }

    pub fn register(&mut self, definition: StepDefinition) -> HarnessResult<()> {
        if self.steps.contains_key(definition.verb) {
            return Err(HarnessError::usage(format!("step '{}' is already registered", definition.verb)));
        }
        self.steps.insert(definition.verb, definition);
        Ok(())
    }

    pub fn get(&self, verb: &str) -> Option<&StepDefinition> {
        self.steps.get(verb)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Definitions sorted by verb.
    pub fn definitions(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.values()
    }

    /// Validate a call without running it.
    pub fn check(&self, call: &StepCall) -> HarnessResult<&StepDefinition> {
        let definition = self
            .get(&call.verb)
            .ok_or_else(|| HarnessError::usage(format!("unknown step '{}'", call.verb)))?;

        for param in definition.params {
            match call.args.get(param.name) {
                None if param.required => {
                    return Err(HarnessError::usage(format!(
                        "step '{}' needs parameter '{}'",
                        call.verb, param.name
                    )));
                }
                Some(arg) if !param.kind.accepts(arg) => {
                    return Err(HarnessError::usage(format!(
                        "step '{}': parameter '{}' must be a {}, got {arg}",
                        call.verb, param.name, param.kind
                    )));
                }
                _ => {}
            }
        }
        if let Some(unknown) = call
            .args
            .keys()
            .find(|name| !definition.params.iter().any(|p| p.name == name.as_str()))
        {
            return Err(HarnessError::usage(format!(
                "step '{}' has no parameter '{unknown}'",
                call.verb
            )));
        }
        Ok(definition)
    }

    /// Every invalid call in `steps`; empty when the plan is runnable.
    pub fn check_plan(&self, steps: &[StepCall]) -> Vec<PlanIssue> {
        steps
            .iter()
            .enumerate()
            .filter_map(|(index, call)| {
                self.check(call).err().map(|err| PlanIssue {
                    index,
                    verb: call.verb.clone(),
                    message: err.to_string(),
                })
            })
            .collect()
    }

    pub fn run(&self, ctx: &mut ScenarioContext, call: &StepCall) -> HarnessResult<()> {
        let definition = self.check(call)?;
        debug!(step = %call, "running step");
        (definition.handler)(ctx, &StepArgs::new(call))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut ScenarioContext, _: &StepArgs<'_>) -> HarnessResult<()> {
        Ok(())
    }

    const PARAMS: &[Param] = &[
        Param::required("name", ParamKind::Str),
        Param::optional("timeout", ParamKind::Duration),
        Param::optional("temporary", ParamKind::Bool),
    ];

    fn registry() -> StepRegistry {
        let mut registry = StepRegistry::new();
        registry
            .register(StepDefinition {
                verb: "touch",
                summary: "test step",
                params: PARAMS,
                handler: noop,
            })
            .unwrap();
        registry
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = registry();
        let again = registry.get("touch").unwrap().clone();
        assert!(matches!(registry.register(again), Err(HarnessError::Usage(_))));
    }

    #[test]
    fn test_check_reports_usage_errors() {
        let registry = registry();
        assert!(registry.check(&StepCall::new("touch").with("name", "x")).is_ok());
        for call in [
            StepCall::new("nope"),
            StepCall::new("touch"),
            StepCall::new("touch").with("name", 3),
            StepCall::new("touch").with("name", "x").with("timeout", true),
            StepCall::new("touch").with("name", "x").with("colour", "red"),
        ] {
            assert!(matches!(registry.check(&call), Err(HarnessError::Usage(_))), "{call}");
        }
    }

    #[test]
    fn test_check_plan_lists_every_issue() {
        let issues = registry().check_plan(&[
            StepCall::new("touch").with("name", "ok"),
            StepCall::new("bogus"),
            StepCall::new("touch"),
        ]);
        assert_eq!(issues.iter().map(|i| i.index).collect::<Vec<_>>(), vec![1, 2]);
        assert!(issues[0].to_string().starts_with("step 2 (bogus)"));
    }

    #[test]
    fn test_typed_getters() {
        let call = StepCall::new("touch")
            .with("name", "disk")
            .with("timeout", "90s")
            .with("count", 3)
            .with("negative", -1)
            .with("temporary", true);
        let args = StepArgs::new(&call);
        assert_eq!(args.str("name").unwrap(), "disk");
        assert_eq!(args.duration("timeout").unwrap(), Duration::from_secs(90));
        assert_eq!(args.u64("count").unwrap(), 3);
        assert_eq!(args.opt_duration("count").unwrap(), Some(Duration::from_secs(3)));
        assert!(args.u64("negative").is_err());
        assert!(args.bool("temporary").unwrap());
        assert!(!args.bool("absent").unwrap());
        assert!(matches!(args.str("count"), Err(HarnessError::Usage(_))));
        assert!(args.opt_str("missing").unwrap().is_none());
    }

    #[test]
    fn test_plan_toml_shape() {
        let call: StepCall = toml::from_str("verb = \"create_disk\"\nargs = { name = \"usb\", size = 8, temporary = true }\n").unwrap();
        assert_eq!(call.args["size"], StepArg::Int(8));
        assert_eq!(call.args["temporary"], StepArg::Bool(true));
        assert_eq!(call.to_string(), "create_disk name=\"usb\" size=8 temporary=true");
    }
}
