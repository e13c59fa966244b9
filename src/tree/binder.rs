//! Argv tokenizer and flag binder.
//!
//! Given one node's schema (its own parameters plus the flags inherited
//! from its ancestors), the binder consumes the front of an argv slice and
//! returns the bound values plus the unconsumed suffix. The chaining
//! interpreter feeds that suffix to the next node.
//!
//! Flag names bind case-sensitively (command names, by contrast, match
//! case-insensitively — that asymmetry is deliberate). The binder is
//! stateless across nodes except for the `visited` set of flag names
//! already bound on this walk, which suppresses re-applied fallbacks and
//! satisfies required checks for flags an earlier node consumed.

use std::collections::{HashMap, HashSet};

use crate::env::Environment;
use crate::error::{Result, TargError};
use crate::params::{ParamDecl, ParamKind, ParamValues, ValueKind, ValueSource};

/// A node's view of its parameters for one binding pass.
pub struct NodeSchema<'a> {
    /// The node's own declarations, in declaration order.
    pub params: &'a [ParamDecl],
    /// Flags inherited from ancestors (accepted on argv, but fallback and
    /// required checks stay with their declaring node).
    pub inherited: Vec<&'a ParamDecl>,
    /// Command path for error messages.
    pub path: String,
}

/// Binding outcome: the values record and the unconsumed argv suffix.
#[derive(Debug)]
pub struct BindResult {
    /// Values for the node's schema.
    pub values: ParamValues,
    /// Tokens the node did not consume.
    pub remainder: Vec<String>,
}

struct Lookup<'a> {
    long: HashMap<&'a str, &'a ParamDecl>,
    short: HashMap<char, &'a str>,
}

impl<'a> Lookup<'a> {
    fn build(schema: &'a NodeSchema<'a>) -> Self {
        let mut long = HashMap::new();
        let mut short = HashMap::new();
        for decl in schema
            .params
            .iter()
            .filter(|d| d.kind == ParamKind::Flag)
            .chain(schema.inherited.iter().copied())
        {
            long.insert(decl.name.as_str(), decl);
            if let Some(c) = decl.short {
                short.insert(c, decl.name.as_str());
            }
        }
        Self { long, short }
    }

    /// Whether a token would parse as a flag of this schema (used as the
    /// stop condition for variadic positionals and trailing values).
    fn is_flag_token(&self, token: &str) -> bool {
        if let Some(rest) = token.strip_prefix("--") {
            if rest.is_empty() {
                return true; // the `--` separator
            }
            let name = rest.split_once('=').map_or(rest, |(n, _)| n);
            return self.long.contains_key(name);
        }
        if let Some(rest) = token.strip_prefix('-') {
            if rest.is_empty() {
                return false; // bare `-` is a value
            }
            let cluster = rest.split_once('=').map_or(rest, |(c, _)| c);
            return cluster.chars().all(|c| self.short.contains_key(&c));
        }
        false
    }
}

/// Bind argv onto a node's schema.
///
/// Consumes long flags (`--name`, `--name value`, `--name=value`), short
/// flags and clusters, then positionals; applies environment and default
/// fallbacks and checks required/enum constraints. Unknown long flags are
/// an error; a short token with unknown members is left unconsumed so an
/// outer chain can interpret it.
pub fn bind(
    schema: &NodeSchema<'_>,
    argv: &[String],
    env: &dyn Environment,
    visited: &mut HashSet<String>,
) -> Result<BindResult> {
    let lookup = Lookup::build(schema);
    let positionals: Vec<&ParamDecl> = schema
        .params
        .iter()
        .filter(|d| d.kind == ParamKind::Positional)
        .collect();

    let mut values = ParamValues::new();
    let mut remainder = Vec::new();
    let mut pos_idx = 0;
    let mut i = 0;
    // Set when the loop stops on a short token with unknown members. The
    // token goes back to the caller (which reports it as unknown-flag
    // before this node executes), so the required check stays quiet.
    let mut unknown_tail = false;

    while i < argv.len() {
        let token = argv[i].as_str();

        if token == "--" {
            remainder.extend(argv[i + 1..].iter().cloned());
            break;
        }

        if let Some(rest) = token.strip_prefix("--") {
            i = bind_long(schema, &lookup, rest, argv, i, &mut values, visited)?;
            continue;
        }

        if token.len() > 1 && token.starts_with('-') {
            match bind_short(&lookup, token, argv, i, &mut values, visited)? {
                Some(next) => {
                    i = next;
                    continue;
                }
                None => {
                    // Unknown member: hand the token (and the rest) back.
                    unknown_tail = true;
                    remainder.extend(argv[i..].iter().cloned());
                    break;
                }
            }
        }

        // Positional phase for this token.
        if pos_idx < positionals.len() {
            let decl = positionals[pos_idx];
            if decl.value == ValueKind::List {
                while i < argv.len() && argv[i] != "--" && !lookup.is_flag_token(&argv[i]) {
                    values.push(&decl.name, argv[i].clone());
                    i += 1;
                }
            } else {
                let value = decl.coerce(token).map_err(|reason| TargError::InvalidValue {
                    name: format!("<{}>", decl.name),
                    value: token.to_string(),
                    reason,
                })?;
                values.set(&decl.name, value, ValueSource::Argv);
                i += 1;
            }
            pos_idx += 1;
            continue;
        }

        remainder.extend(argv[i..].iter().cloned());
        break;
    }

    apply_fallbacks(schema, env, &mut values, visited)?;
    if !unknown_tail {
        check_required(schema, &values, visited)?;
    }

    Ok(BindResult { values, remainder })
}

/// Bind one long-flag token; returns the next argv index.
fn bind_long(
    schema: &NodeSchema<'_>,
    lookup: &Lookup<'_>,
    rest: &str,
    argv: &[String],
    i: usize,
    values: &mut ParamValues,
    visited: &mut HashSet<String>,
) -> Result<usize> {
    let (name, inline) = match rest.split_once('=') {
        Some((n, v)) => (n, Some(v.to_string())),
        None => (rest, None),
    };
    let Some(&decl) = lookup.long.get(name) else {
        return Err(TargError::UnknownFlag {
            flag: format!("--{name}"),
            node: schema.path.clone(),
        });
    };

    let mut next = i + 1;
    if decl.takes_value() {
        let value = match inline {
            Some(v) => Some(v),
            None if next < argv.len() && !looks_like_flag(&argv[next]) => {
                let v = argv[next].clone();
                next += 1;
                Some(v)
            }
            None => None,
        };
        if let Some(raw) = value {
            set_flag(decl, &raw, values, visited)?;
        }
        // With no value available the slot stays unset; the required
        // check reports it if it matters.
    } else {
        let raw = inline.unwrap_or_else(|| "true".to_string());
        set_flag(decl, &raw, values, visited)?;
    }
    Ok(next)
}

/// Bind one short-flag token (single or cluster); returns the next argv
/// index, or `None` when the token contains an unknown member and must be
/// handed back to the caller.
fn bind_short(
    lookup: &Lookup<'_>,
    token: &str,
    argv: &[String],
    i: usize,
    values: &mut ParamValues,
    visited: &mut HashSet<String>,
) -> Result<Option<usize>> {
    let body = &token[1..];
    let (cluster, inline) = match body.split_once('=') {
        Some((c, v)) => (c, Some(v.to_string())),
        None => (body, None),
    };

    // `-name` where `name` is a long flag is a trap, not a cluster.
    if cluster.chars().count() > 1 && lookup.long.contains_key(cluster) {
        return Err(TargError::LongFlagFormat {
            flag: cluster.to_string(),
        });
    }

    let members: Vec<char> = cluster.chars().collect();
    if members.iter().any(|c| !lookup.short.contains_key(c)) {
        return Ok(None);
    }

    // Every member but the last must be a bool flag.
    for (j, c) in members.iter().enumerate() {
        let decl = lookup.long[lookup.short[c]];
        if decl.takes_value() && j + 1 < members.len() {
            return Err(TargError::ShortGroupNotBool {
                cluster: cluster.to_string(),
                flag: *c,
            });
        }
    }

    let mut next = i + 1;
    for (j, c) in members.iter().enumerate() {
        let decl = lookup.long[lookup.short[c]];
        if !decl.takes_value() {
            set_flag(decl, "true", values, visited)?;
            continue;
        }
        // Value-taking member (always last): inline value, else the next
        // token when it is not flag-shaped, else leave unset.
        debug_assert_eq!(j + 1, members.len());
        let value = match &inline {
            Some(v) => Some(v.clone()),
            None if next < argv.len() && !looks_like_flag(&argv[next]) => {
                let v = argv[next].clone();
                next += 1;
                Some(v)
            }
            None => None,
        };
        if let Some(raw) = value {
            set_flag(decl, &raw, values, visited)?;
        }
    }
    Ok(Some(next))
}

fn set_flag(
    decl: &ParamDecl,
    raw: &str,
    values: &mut ParamValues,
    visited: &mut HashSet<String>,
) -> Result<()> {
    let value = decl.coerce(raw).map_err(|reason| TargError::InvalidValue {
        name: format!("--{}", decl.name),
        value: raw.to_string(),
        reason,
    })?;
    values.set(&decl.name, value, ValueSource::Argv);
    visited.insert(decl.name.clone());
    Ok(())
}

fn looks_like_flag(token: &str) -> bool {
    token.len() > 1 && token.starts_with('-')
}

/// Environment and default fallback for the node's own declarations.
fn apply_fallbacks(
    schema: &NodeSchema<'_>,
    env: &dyn Environment,
    values: &mut ParamValues,
    visited: &HashSet<String>,
) -> Result<()> {
    for decl in schema.params {
        if values.is_set(&decl.name) || visited.contains(&decl.name) {
            continue;
        }
        if let Some(var) = &decl.env {
            if let Some(raw) = env.getenv(var).filter(|v| !v.is_empty()) {
                let value = decl.coerce(&raw).map_err(|reason| TargError::InvalidValue {
                    name: format!("--{} (from ${var})", decl.name),
                    value: raw.clone(),
                    reason,
                })?;
                values.set(&decl.name, value, ValueSource::Env);
                continue;
            }
        }
        if let Some(default) = &decl.default {
            let value = decl
                .coerce(default)
                .map_err(|reason| TargError::InvalidValue {
                    name: format!("--{} (default)", decl.name),
                    value: default.clone(),
                    reason,
                })?;
            values.set(&decl.name, value, ValueSource::Default);
        }
    }
    Ok(())
}

/// Required checks after all sources.
fn check_required(
    schema: &NodeSchema<'_>,
    values: &ParamValues,
    visited: &HashSet<String>,
) -> Result<()> {
    for decl in schema.params {
        if !decl.required || values.is_set(&decl.name) || visited.contains(&decl.name) {
            continue;
        }
        return Err(match decl.kind {
            ParamKind::Flag => TargError::MissingRequired {
                flag: decl.display_flag(),
            },
            ParamKind::Positional => TargError::MissingPositional {
                name: decl.name.clone(),
                node: schema.path.clone(),
            },
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::TestEnvironment;
    use crate::params::ParamValue;

    fn greet_params() -> Vec<ParamDecl> {
        vec![
            ParamDecl::flag("name").short('n').required(),
            ParamDecl::flag("loud").short('l').of(ValueKind::Bool),
        ]
    }

    fn schema(params: &[ParamDecl]) -> NodeSchema<'_> {
        NodeSchema {
            params,
            inherited: Vec::new(),
            path: "greet".to_string(),
        }
    }

    fn argv(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(ToString::to_string).collect()
    }

    fn bind_ok(params: &[ParamDecl], tokens: &[&str]) -> BindResult {
        let env = TestEnvironment::new(&["targ"]);
        bind(&schema(params), &argv(tokens), &env, &mut HashSet::new()).unwrap()
    }

    #[test]
    fn test_long_flag_forms() {
        let params = greet_params();
        for tokens in [
            &["--name", "world"][..],
            &["--name=world"][..],
        ] {
            let r = bind_ok(&params, tokens);
            assert_eq!(r.values.get_str("name").as_deref(), Some("world"));
            assert!(r.remainder.is_empty());
        }
    }

    #[test]
    fn test_short_flag_forms() {
        let params = greet_params();
        for tokens in [&["-n", "world"][..], &["-n=world"][..]] {
            let r = bind_ok(&params, tokens);
            assert_eq!(r.values.get_str("name").as_deref(), Some("world"));
        }
    }

    #[test]
    fn test_unknown_long_flag_errors() {
        let params = greet_params();
        let env = TestEnvironment::new(&["targ"]);
        let err = bind(
            &schema(&params),
            &argv(&["--name", "w", "--bogus"]),
            &env,
            &mut HashSet::new(),
        )
        .unwrap_err();
        assert!(matches!(err, TargError::UnknownFlag { .. }));
        assert!(err.to_string().contains("--bogus"));
    }

    #[test]
    fn test_unknown_short_left_in_remainder() {
        let params = greet_params();
        let r = bind_ok(&params, &["--name", "w", "-x", "tail"]);
        assert_eq!(r.remainder, argv(&["-x", "tail"]));
    }

    #[test]
    fn test_cluster_expansion() {
        let params = greet_params();
        // -ln: l is bool, n takes a value but the next token is a flag,
        // so n stays unset here and --name binds it.
        let r = bind_ok(&params, &["-ln", "--name", "world"]);
        assert!(r.values.get_bool("loud"));
        assert_eq!(r.values.get_str("name").as_deref(), Some("world"));

        // -ln world: the trailing value feeds n.
        let r = bind_ok(&params, &["-ln", "world"]);
        assert!(r.values.get_bool("loud"));
        assert_eq!(r.values.get_str("name").as_deref(), Some("world"));
    }

    #[test]
    fn test_cluster_non_bool_not_last_errors() {
        let params = greet_params();
        let env = TestEnvironment::new(&["targ"]);
        let err = bind(
            &schema(&params),
            &argv(&["-nl", "world"]),
            &env,
            &mut HashSet::new(),
        )
        .unwrap_err();
        assert!(matches!(err, TargError::ShortGroupNotBool { flag: 'n', .. }));
    }

    #[test]
    fn test_single_dash_long_name_rejected() {
        let params = greet_params();
        let env = TestEnvironment::new(&["targ"]);
        let err = bind(
            &schema(&params),
            &argv(&["-name", "world"]),
            &env,
            &mut HashSet::new(),
        )
        .unwrap_err();
        assert!(matches!(err, TargError::LongFlagFormat { .. }));
        assert!(err.to_string().contains("--name"));
    }

    #[test]
    fn test_positional_binding() {
        let params = vec![
            ParamDecl::positional("name").required(),
            ParamDecl::flag("loud").short('l').of(ValueKind::Bool),
        ];
        let r = bind_ok(&params, &["world", "-l"]);
        assert_eq!(r.values.get_str("name").as_deref(), Some("world"));
        assert!(r.values.get_bool("loud"));
    }

    #[test]
    fn test_variadic_positional_stops_at_separator() {
        let params = vec![
            ParamDecl::positional("files").of(ValueKind::List),
            ParamDecl::flag("loud").short('l').of(ValueKind::Bool),
        ];
        let r = bind_ok(&params, &["a.txt", "b.txt", "-l", "c.txt"]);
        assert_eq!(
            r.values.get_list("files").unwrap(),
            &["a.txt".to_string(), "b.txt".to_string()]
        );
        assert!(r.values.get_bool("loud"));
        // c.txt arrives after the variadic slot was closed.
        assert_eq!(r.remainder, argv(&["c.txt"]));
    }

    #[test]
    fn test_double_dash_returns_remainder() {
        let params = vec![ParamDecl::positional("files").of(ValueKind::List)];
        let r = bind_ok(&params, &["a.txt", "--", "b.txt", "c.txt"]);
        assert_eq!(r.values.get_list("files").unwrap(), &["a.txt".to_string()]);
        assert_eq!(r.remainder, argv(&["b.txt", "c.txt"]));
    }

    #[test]
    fn test_env_and_default_fallback() {
        let params = vec![
            ParamDecl::flag("namespace").env("DEPLOY_NS").default_value("dev"),
            ParamDecl::flag("region").default_value("us-east-1"),
        ];
        let env = TestEnvironment::new(&["targ"]).with_var("DEPLOY_NS", "prod");
        let r = bind(&schema(&params), &[], &env, &mut HashSet::new()).unwrap();
        assert_eq!(r.values.get_str("namespace").as_deref(), Some("prod"));
        assert!(!r.values.set_from_argv("namespace"));
        assert_eq!(r.values.get_str("region").as_deref(), Some("us-east-1"));
    }

    #[test]
    fn test_empty_env_value_falls_through_to_default() {
        let params = vec![ParamDecl::flag("namespace").env("DEPLOY_NS").default_value("dev")];
        let env = TestEnvironment::new(&["targ"]).with_var("DEPLOY_NS", "");
        let r = bind(&schema(&params), &[], &env, &mut HashSet::new()).unwrap();
        assert_eq!(r.values.get_str("namespace").as_deref(), Some("dev"));
    }

    #[test]
    fn test_missing_required_flag() {
        let params = greet_params();
        let env = TestEnvironment::new(&["targ"]);
        let err = bind(&schema(&params), &[], &env, &mut HashSet::new()).unwrap_err();
        assert!(matches!(err, TargError::MissingRequired { .. }));
        assert!(err.to_string().contains("--name, -n"));
    }

    #[test]
    fn test_missing_required_positional() {
        let params = vec![ParamDecl::positional("file").required()];
        let env = TestEnvironment::new(&["targ"]);
        let err = bind(&schema(&params), &[], &env, &mut HashSet::new()).unwrap_err();
        assert!(matches!(err, TargError::MissingPositional { .. }));
    }

    #[test]
    fn test_visited_satisfies_required() {
        let params = greet_params();
        let env = TestEnvironment::new(&["targ"]);
        let mut visited = HashSet::new();
        visited.insert("name".to_string());
        let r = bind(&schema(&params), &[], &env, &mut visited).unwrap();
        assert!(!r.values.is_set("name"));
    }

    #[test]
    fn test_inherited_flags_accepted() {
        let own = vec![ParamDecl::flag("fast").of(ValueKind::Bool)];
        let verbose = ParamDecl::flag("verbose").short('v').of(ValueKind::Bool);
        let schema = NodeSchema {
            params: &own,
            inherited: vec![&verbose],
            path: "build api".to_string(),
        };
        let env = TestEnvironment::new(&["targ"]);
        let mut visited = HashSet::new();
        let r = bind(&schema, &argv(&["--verbose", "--fast"]), &env, &mut visited).unwrap();
        assert!(r.values.get_bool("verbose"));
        assert!(r.values.get_bool("fast"));
        assert!(visited.contains("verbose"));
    }

    #[test]
    fn test_enum_validation() {
        let params = vec![ParamDecl::flag("mode").one_of("serial|parallel")];
        let env = TestEnvironment::new(&["targ"]);
        let err = bind(
            &schema(&params),
            &argv(&["--mode", "both"]),
            &env,
            &mut HashSet::new(),
        )
        .unwrap_err();
        assert!(matches!(err, TargError::InvalidValue { .. }));
        assert!(err.to_string().contains("serial|parallel"));
    }

    #[test]
    fn test_bool_inline_values() {
        let params = greet_params();
        let r = bind_ok(&params, &["--name", "w", "--loud=false"]);
        assert_eq!(
            r.values.get("loud").unwrap().value,
            ParamValue::Bool(false)
        );
    }

    #[test]
    fn test_int_coercion_failure() {
        let params = vec![ParamDecl::flag("count").of(ValueKind::Int)];
        let env = TestEnvironment::new(&["targ"]);
        let err = bind(
            &schema(&params),
            &argv(&["--count", "three"]),
            &env,
            &mut HashSet::new(),
        )
        .unwrap_err();
        assert!(matches!(err, TargError::InvalidValue { .. }));
    }

    #[test]
    fn test_binding_is_deterministic() {
        let params = greet_params();
        let tokens = ["-l", "--name", "world"];
        let a = bind_ok(&params, &tokens);
        let b = bind_ok(&params, &tokens);
        assert_eq!(a.values.get_str("name"), b.values.get_str("name"));
        assert_eq!(a.values.get_bool("loud"), b.values.get_bool("loud"));
        assert_eq!(a.remainder, b.remainder);
    }
}
