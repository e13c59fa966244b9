//! Machine-readable target listing.
//!
//! The reserved `__list` subcommand prints the full command tree as JSON
//! for editor integrations and scripts.

use serde_json::{json, Value};

use crate::params::{ParamDecl, ParamKind};
use crate::tree::{CommandTree, NodeId, NodeKind};

/// Render the whole tree as a JSON array of target records.
#[must_use]
pub fn render(tree: &CommandTree) -> String {
    let roots: Vec<Value> = tree.roots().iter().map(|&id| node_json(tree, id)).collect();
    serde_json::to_string_pretty(&Value::Array(roots)).unwrap_or_else(|_| "[]".to_string())
}

fn node_json(tree: &CommandTree, id: NodeId) -> Value {
    let node = tree.node(id);
    let kind = match &node.kind {
        NodeKind::Func(_) => "function",
        NodeKind::Shell { .. } => "shell",
        NodeKind::DepsOnly => "deps-only",
        NodeKind::Group => "group",
    };
    let flags: Vec<Value> = node
        .params
        .iter()
        .filter(|d| d.kind == ParamKind::Flag)
        .map(param_json)
        .collect();
    let positionals: Vec<Value> = node
        .params
        .iter()
        .filter(|d| d.kind == ParamKind::Positional)
        .map(param_json)
        .collect();
    let subcommands: Vec<Value> = node
        .children
        .values()
        .map(|&child| node_json(tree, child))
        .collect();

    json!({
        "name": node.name,
        "path": tree.path(id),
        "kind": kind,
        "description": node.description,
        "source": node.source_package,
        "flags": flags,
        "positionals": positionals,
        "subcommands": subcommands,
    })
}

fn param_json(decl: &ParamDecl) -> Value {
    json!({
        "name": decl.name,
        "short": decl.short.map(String::from),
        "env": decl.env,
        "default": decl.default,
        "enum": decl.enum_values,
        "required": decl.required,
        "description": decl.description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::target::{GroupSpec, Member, TargetSpec};

    #[test]
    fn test_render_round_trips_as_json() {
        let deploy = TargetSpec::builder("deploy")
            .description("Apply manifests")
            .shell("kubectl apply -n $namespace -f $file")
            .build()
            .unwrap();
        let ci = GroupSpec::new(
            "ci",
            vec![Member::Target(
                TargetSpec::builder("lint").shell("true").build().unwrap(),
            )],
        );
        let mut reg = Registry::new();
        reg.register([Member::Target(deploy), Member::Group(ci)]);
        let tree = CommandTree::build(&reg.resolve().unwrap().entries).unwrap();

        let rendered = render(&tree);
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["name"], "deploy");
        assert_eq!(parsed[0]["kind"], "shell");
        assert_eq!(parsed[0]["flags"].as_array().unwrap().len(), 2);
        assert_eq!(parsed[0]["flags"][0]["name"], "namespace");
        assert_eq!(parsed[0]["flags"][0]["required"], true);
        assert_eq!(parsed[1]["kind"], "group");
        assert_eq!(parsed[1]["subcommands"][0]["path"], "ci lint");
    }
}
