//! Help rendering.
//!
//! Free functions producing the help text for the root target list and
//! for individual nodes: a one-line description, a usage line wrapped to
//! 80 columns with continuations aligned under the command prefix,
//! inherited and own flags, positionals, subcommands, and a more-info
//! line from the source attribution.

use crate::env::Environment;
use crate::params::{ParamDecl, ParamKind, ValueKind};
use crate::registry::Resolution;
use crate::tree::{CommandTree, NodeId, NodeKind};

/// Maximum rendered line width.
const WIDTH: usize = 80;

/// Render the root help: usage, the target list, and any hidden
/// (deregistered) packages.
#[must_use]
pub fn root_help(tree: &CommandTree, env: &dyn Environment, resolution: &Resolution) -> String {
    let bin = env.binary_name();
    let mut out = String::new();
    out.push_str(&format!("{bin} — run declared targets by name\n\n"));
    out.push_str(&wrap_words(
        &format!("Usage: {bin} "),
        &[
            "[flags]".to_string(),
            "<target>".to_string(),
            "[args]".to_string(),
            "[^ <target> [args] ...]".to_string(),
        ],
    ));
    out.push('\n');

    if tree.roots().is_empty() {
        out.push_str("\nNo targets registered.\n");
    } else {
        out.push_str("\nTargets:\n");
        let width = tree
            .roots()
            .iter()
            .map(|&id| tree.node(id).name.len())
            .max()
            .unwrap_or(0);
        for &id in tree.roots() {
            let node = tree.node(id);
            let summary = if node.description.is_empty() {
                kind_label(&node.kind).to_string()
            } else {
                node.description.clone()
            };
            out.push_str(&format!("  {:<width$}  {}\n", node.name, summary));
        }
    }

    if !resolution.deregistered.is_empty() {
        out.push_str(&format!(
            "\nHidden packages (deregistered): {}\n",
            resolution.deregistered.join(", ")
        ));
    }
    out
}

/// Render one node's help.
#[must_use]
pub fn node_help(
    tree: &CommandTree,
    id: NodeId,
    env: &dyn Environment,
    source_override: Option<&str>,
) -> String {
    let node = tree.node(id);
    let bin = env.binary_name();
    let path = tree.path(id);
    let mut out = String::new();

    if !node.description.is_empty() {
        out.push_str(&node.description);
        out.push('\n');
        out.push('\n');
    }

    out.push_str(&usage_line(tree, id, &bin));
    out.push('\n');

    let inherited = inherited_flags(tree, id);
    if !inherited.is_empty() {
        out.push_str("\nInherited flags:\n");
        push_flag_table(&mut out, &inherited);
    }

    let own_flags: Vec<&ParamDecl> = node
        .params
        .iter()
        .filter(|d| d.kind == ParamKind::Flag)
        .collect();
    if !own_flags.is_empty() {
        out.push_str("\nFlags:\n");
        push_flag_table(&mut out, &own_flags);
    }

    let positionals: Vec<&ParamDecl> = node
        .params
        .iter()
        .filter(|d| d.kind == ParamKind::Positional)
        .collect();
    if !positionals.is_empty() {
        out.push_str("\nArguments:\n");
        push_flag_table(&mut out, &positionals);
    }

    if !node.children.is_empty() {
        out.push_str("\nSubcommands:\n");
        let width = node
            .children
            .values()
            .map(|&c| tree.node(c).name.len())
            .max()
            .unwrap_or(0);
        for &child in node.children.values() {
            let child_node = tree.node(child);
            out.push_str(&format!(
                "  {:<width$}  {}\n",
                child_node.name, child_node.description
            ));
        }
        out.push_str(&format!(
            "\nRun '{bin} {path} <subcommand> --help' for details.\n"
        ));
    }

    let info = source_override
        .map(ToString::to_string)
        .or_else(|| (!node.source_file.is_empty()).then(|| node.source_file.clone()))
        .or_else(|| (!node.source_package.is_empty()).then(|| node.source_package.clone()));
    if let Some(info) = info {
        out.push_str(&format!("\nMore info: {info}\n"));
    }
    out
}

/// One-line usage hint appended to flag errors.
#[must_use]
pub fn usage_hint(bin: &str, path: &str) -> String {
    if path.is_empty() {
        format!("Run '{bin} --help' for usage.")
    } else {
        format!("Run '{bin} {path} --help' for usage.")
    }
}

/// The usage line: required flags inline, everything optional summarized
/// as `[flags...]`, then positionals. Wrapped to 80 columns with
/// continuations aligned under the command prefix.
fn usage_line(tree: &CommandTree, id: NodeId, bin: &str) -> String {
    let node = tree.node(id);
    let prefix = format!("Usage: {bin} {} ", tree.path(id));
    let mut words = Vec::new();

    let mut has_optional = !inherited_flags(tree, id).is_empty();
    for decl in node.params.iter().filter(|d| d.kind == ParamKind::Flag) {
        if decl.required {
            words.push(flag_usage(decl));
        } else {
            has_optional = true;
        }
    }
    if has_optional {
        words.push("[flags...]".to_string());
    }
    for decl in node.params.iter().filter(|d| d.kind == ParamKind::Positional) {
        let word = match (decl.required, decl.value) {
            (_, ValueKind::List) => format!("[<{}>...]", decl.name),
            (true, _) => format!("<{}>", decl.name),
            (false, _) => format!("[<{}>]", decl.name),
        };
        words.push(word);
    }
    if !node.children.is_empty() {
        words.push("[subcommand]".to_string());
    }
    wrap_words(&prefix, &words)
}

/// Greedy word-wrap at `WIDTH` columns; continuation lines are indented
/// to the prefix length.
fn wrap_words(prefix: &str, words: &[String]) -> String {
    let indent = " ".repeat(prefix.len());
    let mut lines: Vec<String> = Vec::new();
    let mut line = prefix.to_string();
    let mut first_word_on_line = true;

    for word in words {
        let needed = if first_word_on_line { 0 } else { 1 } + word.len();
        if !first_word_on_line && line.len() + needed > WIDTH {
            lines.push(line.trim_end().to_string());
            line = indent.clone();
            first_word_on_line = true;
        }
        if !first_word_on_line {
            line.push(' ');
        }
        line.push_str(word);
        first_word_on_line = false;
    }
    lines.push(line.trim_end().to_string());
    lines.join("\n")
}

/// `--name, -n <PLACEHOLDER>` (value-taking) or `--name, -n` (bool).
fn flag_usage(decl: &ParamDecl) -> String {
    if decl.takes_value() {
        format!("--{} <{}>", decl.name, placeholder(decl))
    } else {
        format!("--{}", decl.name)
    }
}

fn placeholder(decl: &ParamDecl) -> String {
    decl.placeholder
        .clone()
        .unwrap_or_else(|| decl.name.to_ascii_uppercase().replace('-', "_"))
}

fn inherited_flags(tree: &CommandTree, id: NodeId) -> Vec<&ParamDecl> {
    tree.ancestors(id)
        .into_iter()
        .flat_map(|a| {
            tree.node(a)
                .params
                .iter()
                .filter(|d| d.kind == ParamKind::Flag)
        })
        .collect()
}

/// Two-column flag table: rendered flag, then description with env,
/// default, enum, and required markers.
fn push_flag_table(out: &mut String, decls: &[&ParamDecl]) {
    let rendered: Vec<String> = decls.iter().map(|d| render_flag(d)).collect();
    let width = rendered.iter().map(String::len).max().unwrap_or(0);
    for (decl, flag) in decls.iter().zip(&rendered) {
        let mut notes = Vec::new();
        if !decl.description.is_empty() {
            notes.push(decl.description.clone());
        }
        if let Some(values) = &decl.enum_values {
            notes.push(format!("one of {}", values.join("|")));
        }
        if let Some(env) = &decl.env {
            notes.push(format!("env: {env}"));
        }
        if let Some(default) = &decl.default {
            notes.push(format!("default: {default}"));
        }
        if decl.required {
            notes.push("required".to_string());
        }
        out.push_str(&format!("  {:<width$}  {}\n", flag, notes.join("; ")));
    }
}

fn render_flag(decl: &ParamDecl) -> String {
    match decl.kind {
        ParamKind::Positional => format!("<{}>", decl.name),
        ParamKind::Flag => {
            let names = match decl.short {
                Some(c) => format!("--{}, -{}", decl.name, c),
                None => format!("--{}", decl.name),
            };
            if decl.takes_value() {
                format!("{names} <{}>", placeholder(decl))
            } else {
                names
            }
        }
    }
}

fn kind_label(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::Func(_) => "(function)",
        NodeKind::Shell { .. } => "(shell)",
        NodeKind::DepsOnly => "(runs dependencies)",
        NodeKind::Group => "(group)",
    }
}
