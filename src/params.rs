//! Parameter declarations and bound values.
//!
//! A command node's schema is a list of [`ParamDecl`]s. The flag binder
//! fills a [`ParamValues`] record from argv, environment variables, and
//! declared defaults; function targets receive that record, shell targets
//! substitute its string values into their command template.
//!
//! Declarations are plain values. Collaborator layers that generate them
//! from their own surface syntax can override any subset of the metadata
//! through an annotation string ([`ParamDecl::apply_annotation`]) or a
//! programmatic hook ([`MetaHook`]).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;

/// Whether a parameter binds as a flag or a positional argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Bound by `--name`/`-x` tokens.
    Flag,
    /// Bound by position after flags are consumed.
    Positional,
}

/// The scalar (or list) type a parameter carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueKind {
    /// Pass-through string.
    #[default]
    Str,
    /// Signed decimal integer.
    Int,
    /// Presence / `true` / `false` / `1` / `0`.
    Bool,
    /// Decimal float.
    Float,
    /// `<int><unit>` with unit in `s`, `m`, `h`.
    Duration,
    /// Variadic list of strings; as a positional this consumes tokens
    /// until `--`, a known flag, or the end of argv.
    List,
}

/// A parsed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// String value.
    Str(String),
    /// Integer value.
    Int(i64),
    /// Boolean value.
    Bool(bool),
    /// Float value.
    Float(f64),
    /// Duration value.
    Duration(Duration),
    /// List value.
    List(Vec<String>),
}

impl ParamValue {
    /// Render the value for shell substitution and help text.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Duration(d) => humantime::format_duration(*d).to_string(),
            Self::List(items) => items.join(" "),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Custom value parser, consulted before builtin coercion.
///
/// This is the string-decoding hook for parameter types the builtin
/// scalars cannot express; it receives the raw token and returns the
/// parsed value or a human-readable reason.
pub type ValueParser =
    Arc<dyn Fn(&str) -> std::result::Result<ParamValue, String> + Send + Sync>;

/// Programmatic metadata hook: given the field name and the declaration
/// derived so far, return the effective declaration. Used to compute
/// metadata that depends on the environment.
pub type MetaHook = Arc<
    dyn Fn(&str, ParamDecl) -> std::result::Result<ParamDecl, String> + Send + Sync,
>;

/// Declaration of one parameter of a command node.
#[derive(Clone)]
pub struct ParamDecl {
    /// CLI name, kebab-case.
    pub name: String,
    /// Optional single-character short flag.
    pub short: Option<char>,
    /// Environment variable consulted when argv leaves the flag unset.
    pub env: Option<String>,
    /// Default applied after the environment fallback.
    pub default: Option<String>,
    /// Placeholder shown in help (`--out <DIR>`).
    pub placeholder: Option<String>,
    /// `|`-separated allowed values, matched case-sensitively.
    pub enum_values: Option<Vec<String>>,
    /// Whether a value must be present after all fallback sources.
    pub required: bool,
    /// One-line description for help.
    pub description: String,
    /// Flag or positional.
    pub kind: ParamKind,
    /// The value type.
    pub value: ValueKind,
    /// Custom parser, preferred over builtin coercion when present.
    pub value_parser: Option<ValueParser>,
}

impl fmt::Debug for ParamDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamDecl")
            .field("name", &self.name)
            .field("short", &self.short)
            .field("env", &self.env)
            .field("default", &self.default)
            .field("required", &self.required)
            .field("kind", &self.kind)
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

impl ParamDecl {
    /// Declare a flag parameter. The name is kebab-cased from the field
    /// name it represents.
    #[must_use]
    pub fn flag(name: &str) -> Self {
        Self {
            name: kebab_case(name),
            short: None,
            env: None,
            default: None,
            placeholder: None,
            enum_values: None,
            required: false,
            description: String::new(),
            kind: ParamKind::Flag,
            value: ValueKind::Str,
            value_parser: None,
        }
    }

    /// Declare a positional parameter.
    #[must_use]
    pub fn positional(name: &str) -> Self {
        Self {
            kind: ParamKind::Positional,
            ..Self::flag(name)
        }
    }

    /// Set the short flag character.
    #[must_use]
    pub fn short(mut self, c: char) -> Self {
        self.short = Some(c);
        self
    }

    /// Set the environment-variable fallback.
    #[must_use]
    pub fn env(mut self, var: &str) -> Self {
        self.env = Some(var.to_string());
        self
    }

    /// Set the default value.
    #[must_use]
    pub fn default_value(mut self, value: &str) -> Self {
        self.default = Some(value.to_string());
        self
    }

    /// Set the help placeholder.
    #[must_use]
    pub fn placeholder(mut self, p: &str) -> Self {
        self.placeholder = Some(p.to_string());
        self
    }

    /// Restrict the value to a `|`-separated set.
    #[must_use]
    pub fn one_of(mut self, values: &str) -> Self {
        self.enum_values = Some(values.split('|').map(ToString::to_string).collect());
        self
    }

    /// Mark the parameter required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set the description.
    #[must_use]
    pub fn describe(mut self, d: &str) -> Self {
        self.description = d.to_string();
        self
    }

    /// Set the value kind.
    #[must_use]
    pub fn of(mut self, value: ValueKind) -> Self {
        self.value = value;
        self
    }

    /// Attach a custom value parser (used in preference to builtin
    /// coercion).
    #[must_use]
    pub fn value_parser(mut self, parser: ValueParser) -> Self {
        self.value_parser = Some(parser);
        self
    }

    /// Apply an annotation string to this declaration.
    ///
    /// The annotation is a comma-separated list of `key=value` pairs plus
    /// the bare words `required` and `positional`. Recognized keys:
    /// `name`, `short`, `env`, `default`, `enum`, `placeholder`, `desc`.
    /// Values cannot contain commas. Unknown keys are an error.
    pub fn apply_annotation(mut self, annotation: &str) -> std::result::Result<Self, String> {
        for part in annotation.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some(("name", v)) => self.name = kebab_case(v),
                Some(("short", v)) => {
                    let mut chars = v.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) => self.short = Some(c),
                        _ => return Err(format!("short must be one character, got '{v}'")),
                    }
                }
                Some(("env", v)) => self.env = Some(v.to_string()),
                Some(("default", v)) => self.default = Some(v.to_string()),
                Some(("enum", v)) => {
                    self.enum_values = Some(v.split('|').map(ToString::to_string).collect());
                }
                Some(("placeholder", v)) => self.placeholder = Some(v.to_string()),
                Some(("desc", v)) => self.description = v.to_string(),
                Some((k, _)) => return Err(format!("unknown annotation key '{k}'")),
                None if part == "required" => self.required = true,
                None if part == "positional" => self.kind = ParamKind::Positional,
                None => return Err(format!("malformed annotation part '{part}'")),
            }
        }
        Ok(self)
    }

    /// Whether this flag consumes a value token (everything but bool).
    #[must_use]
    pub fn takes_value(&self) -> bool {
        self.value != ValueKind::Bool
    }

    /// Render the flag for error messages: `--name` or `--name, -x`.
    #[must_use]
    pub fn display_flag(&self) -> String {
        match self.short {
            Some(c) => format!("--{}, -{}", self.name, c),
            None => format!("--{}", self.name),
        }
    }

    /// Coerce a raw token into this parameter's value, consulting the
    /// custom parser first and validating against the enum set.
    pub fn coerce(&self, raw: &str) -> std::result::Result<ParamValue, String> {
        if let Some(allowed) = &self.enum_values {
            if !allowed.iter().any(|v| v == raw) {
                return Err(format!("expected one of {}", allowed.join("|")));
            }
        }
        if let Some(parser) = &self.value_parser {
            return parser(raw);
        }
        match self.value {
            ValueKind::Str => Ok(ParamValue::Str(raw.to_string())),
            ValueKind::Int => raw
                .parse::<i64>()
                .map(ParamValue::Int)
                .map_err(|_| "expected an integer".to_string()),
            ValueKind::Bool => match raw {
                "true" | "1" => Ok(ParamValue::Bool(true)),
                "false" | "0" => Ok(ParamValue::Bool(false)),
                _ => Err("expected true, false, 1, or 0".to_string()),
            },
            ValueKind::Float => raw
                .parse::<f64>()
                .map(ParamValue::Float)
                .map_err(|_| "expected a number".to_string()),
            ValueKind::Duration => parse_duration(raw).map(ParamValue::Duration),
            ValueKind::List => Ok(ParamValue::List(vec![raw.to_string()])),
        }
    }
}

/// Parse a duration token: `<int><unit>` with unit `s`, `m`, or `h`.
/// A bare `0` is accepted as zero (used to disable timeouts).
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    if raw == "0" {
        return Ok(Duration::ZERO);
    }
    let (digits, unit) = raw.split_at(raw.len().saturating_sub(1));
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("expected <int><unit> duration, got '{raw}'"))?;
    match unit {
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(format!("duration unit must be s, m, or h, got '{raw}'")),
    }
}

/// Kebab-case a field name: lowercase with `_` replaced by `-`.
#[must_use]
pub fn kebab_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len() + 2);
    for (i, c) in field.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else if c == '_' {
            out.push('-');
        } else {
            out.push(c);
        }
    }
    out
}

/// How a slot received its value, for help and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// Bound from argv.
    Argv,
    /// Filled from the declared environment variable.
    Env,
    /// Filled from the declared default.
    Default,
}

/// One bound parameter slot.
#[derive(Debug, Clone)]
pub struct BoundParam {
    /// The parsed value.
    pub value: ParamValue,
    /// Where the value came from.
    pub source: ValueSource,
}

/// The record of bound parameters the binder produces for one node,
/// insertion-ordered by declaration.
#[derive(Debug, Clone, Default)]
pub struct ParamValues {
    slots: IndexMap<String, BoundParam>,
}

impl ParamValues {
    /// Empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a value into a slot.
    pub fn set(&mut self, name: &str, value: ParamValue, source: ValueSource) {
        self.slots
            .insert(name.to_string(), BoundParam { value, source });
    }

    /// Append to a list slot (variadic positionals).
    pub fn push(&mut self, name: &str, item: String) {
        match self.slots.get_mut(name) {
            Some(BoundParam {
                value: ParamValue::List(items),
                ..
            }) => items.push(item),
            _ => self.set(name, ParamValue::List(vec![item]), ValueSource::Argv),
        }
    }

    /// Whether the slot received any value.
    #[must_use]
    pub fn is_set(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    /// Whether the slot was bound from argv (not env/default fallback).
    #[must_use]
    pub fn set_from_argv(&self, name: &str) -> bool {
        matches!(
            self.slots.get(name),
            Some(BoundParam {
                source: ValueSource::Argv,
                ..
            })
        )
    }

    /// The raw slot, if bound.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&BoundParam> {
        self.slots.get(name)
    }

    /// String accessor; non-string values render.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<String> {
        self.slots.get(name).map(|b| b.value.render())
    }

    /// Bool accessor; unset is false.
    #[must_use]
    pub fn get_bool(&self, name: &str) -> bool {
        matches!(
            self.slots.get(name),
            Some(BoundParam {
                value: ParamValue::Bool(true),
                ..
            })
        )
    }

    /// Int accessor.
    #[must_use]
    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.slots.get(name) {
            Some(BoundParam {
                value: ParamValue::Int(i),
                ..
            }) => Some(*i),
            _ => None,
        }
    }

    /// Duration accessor.
    #[must_use]
    pub fn get_duration(&self, name: &str) -> Option<Duration> {
        match self.slots.get(name) {
            Some(BoundParam {
                value: ParamValue::Duration(d),
                ..
            }) => Some(*d),
            _ => None,
        }
    }

    /// List accessor.
    #[must_use]
    pub fn get_list(&self, name: &str) -> Option<&[String]> {
        match self.slots.get(name) {
            Some(BoundParam {
                value: ParamValue::List(items),
                ..
            }) => Some(items),
            _ => None,
        }
    }

    /// Iterate slots in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BoundParam)> {
        self.slots.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of bound slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kebab_case() {
        assert_eq!(kebab_case("OutDir"), "out-dir");
        assert_eq!(kebab_case("name"), "name");
        assert_eq!(kebab_case("dry_run"), "dry-run");
        assert_eq!(kebab_case("HTTPPort"), "h-t-t-p-port");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("30x").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_annotation_overrides() {
        let decl = ParamDecl::flag("namespace")
            .apply_annotation("short=n,env=NAMESPACE,default=dev,desc=Deploy namespace")
            .unwrap();
        assert_eq!(decl.short, Some('n'));
        assert_eq!(decl.env.as_deref(), Some("NAMESPACE"));
        assert_eq!(decl.default.as_deref(), Some("dev"));
        assert_eq!(decl.description, "Deploy namespace");
        assert!(!decl.required);

        let decl = ParamDecl::flag("file")
            .apply_annotation("required,positional,placeholder=FILE")
            .unwrap();
        assert!(decl.required);
        assert_eq!(decl.kind, ParamKind::Positional);
        assert_eq!(decl.placeholder.as_deref(), Some("FILE"));
    }

    #[test]
    fn test_annotation_rejects_unknown_keys() {
        assert!(ParamDecl::flag("x").apply_annotation("colour=red").is_err());
        assert!(ParamDecl::flag("x").apply_annotation("short=ab").is_err());
    }

    #[test]
    fn test_coerce_scalars() {
        let b = ParamDecl::flag("loud").of(ValueKind::Bool);
        assert_eq!(b.coerce("true").unwrap(), ParamValue::Bool(true));
        assert_eq!(b.coerce("0").unwrap(), ParamValue::Bool(false));
        assert!(b.coerce("loudly").is_err());

        let i = ParamDecl::flag("count").of(ValueKind::Int);
        assert_eq!(i.coerce("-3").unwrap(), ParamValue::Int(-3));
        assert!(i.coerce("three").is_err());

        let d = ParamDecl::flag("wait").of(ValueKind::Duration);
        assert_eq!(
            d.coerce("90s").unwrap(),
            ParamValue::Duration(Duration::from_secs(90))
        );
    }

    #[test]
    fn test_coerce_enum_is_case_sensitive() {
        let decl = ParamDecl::flag("mode").one_of("serial|parallel");
        assert!(decl.coerce("serial").is_ok());
        assert!(decl.coerce("Serial").is_err());
    }

    #[test]
    fn test_custom_parser_preferred() {
        let decl = ParamDecl::flag("pair").value_parser(Arc::new(|raw| {
            raw.split_once(':')
                .map(|(a, _)| ParamValue::Str(a.to_string()))
                .ok_or_else(|| "expected a:b".to_string())
        }));
        assert_eq!(
            decl.coerce("x:y").unwrap(),
            ParamValue::Str("x".to_string())
        );
        assert!(decl.coerce("nope").is_err());
    }

    #[test]
    fn test_values_record() {
        let mut values = ParamValues::new();
        values.set("name", ParamValue::Str("world".into()), ValueSource::Argv);
        values.set("loud", ParamValue::Bool(true), ValueSource::Default);
        values.push("files", "a.txt".into());
        values.push("files", "b.txt".into());

        assert_eq!(values.get_str("name").as_deref(), Some("world"));
        assert!(values.get_bool("loud"));
        assert!(values.set_from_argv("name"));
        assert!(!values.set_from_argv("loud"));
        assert_eq!(values.get_list("files").unwrap().len(), 2);
        let order: Vec<_> = values.iter().map(|(k, _)| k).collect();
        assert_eq!(order, vec!["name", "loud", "files"]);
    }
}
