//! Command tree construction.
//!
//! The resolved registry's ordered entries become a tree of command
//! nodes. Nodes live in an arena ([`CommandTree::nodes`]) and refer to
//! each other by index, so parent back-references never form ownership
//! cycles. Function bodies are shape-checked here; shell templates get a
//! synthesized parameter schema (one required string flag per `$var`);
//! flag collisions along a path are fatal before anything executes.

mod binder;

pub use binder::{bind, BindResult, NodeSchema};

use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, TargError};
use crate::params::{ParamDecl, ParamKind};
use crate::registry::ResolvedEntry;
use crate::target::{self, Body, GroupSpec, Member, RunConfig, TargetFn, TargetSpec};

/// Matches `$var` and `${var}` placeholders in shell templates.
static VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("static pattern"));

/// The placeholder pattern, shared with shell dispatch.
pub(crate) fn var_pattern() -> &'static Regex {
    &VAR_PATTERN
}

/// Index of a node in the tree arena.
pub type NodeId = usize;

/// What a node does when invoked.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Call a function.
    Func(TargetFn),
    /// Substitute variables and hand the template to the shell runner.
    Shell {
        /// The raw command template.
        template: String,
        /// Lowercased variable names, first-occurrence order.
        vars: Vec<String>,
    },
    /// Run dependencies only.
    DepsOnly,
    /// Namespace for child commands.
    Group,
}

/// One node of the command tree.
#[derive(Debug)]
pub struct CommandNode {
    /// Arena index of this node.
    pub id: NodeId,
    /// Arena index of the parent, if any.
    pub parent: Option<NodeId>,
    /// CLI name.
    pub name: String,
    /// Human description.
    pub description: String,
    /// Execution kind.
    pub kind: NodeKind,
    /// Parameter schema (declared for functions, synthesized for shell
    /// templates, empty otherwise).
    pub params: Vec<ParamDecl>,
    /// Execution configuration from the description.
    pub config: RunConfig,
    /// The originating description; carries execution identity for
    /// dependency dedup and cache keys.
    pub spec: Option<Arc<TargetSpec>>,
    /// Children keyed by name, insertion-ordered.
    pub children: IndexMap<String, NodeId>,
    /// Effective origin package; empty for local nodes.
    pub source_package: String,
    /// Declaring source file, when known.
    pub source_file: String,
}

impl CommandNode {
    /// Whether this node is a pure namespace.
    #[must_use]
    pub fn is_group(&self) -> bool {
        matches!(self.kind, NodeKind::Group)
    }
}

/// The command tree: an arena of nodes plus the ordered root list.
#[derive(Debug, Default)]
pub struct CommandTree {
    nodes: Vec<CommandNode>,
    roots: Vec<NodeId>,
}

impl CommandTree {
    /// Build the tree from the resolved registry entries.
    pub fn build(entries: &[ResolvedEntry]) -> Result<Self> {
        let mut tree = Self::default();
        for entry in entries {
            let id = tree.add_member(None, &entry.member, &entry.source, &entry.source_file)?;
            tree.roots.push(id);
        }
        tree.check_flag_conflicts()?;
        Ok(tree)
    }

    /// Ordered root node ids.
    #[must_use]
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Node by id. Ids handed out by this tree are always valid.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &CommandNode {
        &self.nodes[id]
    }

    /// Ancestor ids from the immediate parent up to the root.
    #[must_use]
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.nodes[id].parent;
        while let Some(p) = cur {
            out.push(p);
            cur = self.nodes[p].parent;
        }
        out
    }

    /// Space-separated command path from the root to this node.
    #[must_use]
    pub fn path(&self, id: NodeId) -> String {
        let mut names = vec![self.nodes[id].name.clone()];
        for ancestor in self.ancestors(id) {
            names.push(self.nodes[ancestor].name.clone());
        }
        names.reverse();
        names.join(" ")
    }

    /// Case-insensitive root lookup.
    #[must_use]
    pub fn find_root(&self, name: &str) -> Option<NodeId> {
        self.roots
            .iter()
            .copied()
            .find(|&id| self.nodes[id].name.eq_ignore_ascii_case(name))
    }

    /// Case-insensitive child lookup.
    #[must_use]
    pub fn find_child(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[id]
            .children
            .values()
            .copied()
            .find(|&c| self.nodes[c].name.eq_ignore_ascii_case(name))
    }

    /// Case-insensitive sibling lookup (nodes sharing this node's
    /// parent; for roots, the other roots).
    #[must_use]
    pub fn find_sibling(&self, id: NodeId, name: &str) -> Option<NodeId> {
        match self.nodes[id].parent {
            Some(parent) => self.find_child(parent, name),
            None => self.find_root(name),
        }
    }

    /// The binder schema for a node: its own parameters plus every
    /// ancestor's (inherited) flags.
    #[must_use]
    pub fn schema_for(&self, id: NodeId) -> NodeSchema<'_> {
        let node = &self.nodes[id];
        let mut inherited = Vec::new();
        for ancestor in self.ancestors(id) {
            for decl in &self.nodes[ancestor].params {
                if decl.kind == ParamKind::Flag {
                    inherited.push(decl);
                }
            }
        }
        NodeSchema {
            params: &node.params,
            inherited,
            path: self.path(id),
        }
    }

    fn add_member(
        &mut self,
        parent: Option<NodeId>,
        member: &Member,
        source: &str,
        source_file: &str,
    ) -> Result<NodeId> {
        match member {
            Member::Target(spec) => self.add_target(parent, spec, source, source_file),
            Member::Group(group) => self.add_group(parent, group, source, source_file),
        }
    }

    fn add_group(
        &mut self,
        parent: Option<NodeId>,
        group: &Arc<GroupSpec>,
        source: &str,
        source_file: &str,
    ) -> Result<NodeId> {
        if !target::is_valid_name(group.name()) {
            return Err(TargError::InvalidArgument {
                name: "name".to_string(),
                reason: format!(
                    "'{}' is not a valid group name (want kebab-case: ^[a-z][a-z0-9-]*$)",
                    group.name()
                ),
            });
        }
        let id = self.push_node(CommandNode {
            id: 0,
            parent,
            name: group.name().to_string(),
            description: String::new(),
            kind: NodeKind::Group,
            params: Vec::new(),
            config: RunConfig::default(),
            spec: None,
            children: IndexMap::new(),
            source_package: source.to_string(),
            source_file: source_file.to_string(),
        });
        for member in group.members() {
            let effective = if member.source().is_empty() {
                source
            } else {
                member.source()
            };
            let child = self.add_member(Some(id), member, effective, source_file)?;
            self.attach_child(id, child)?;
        }
        Ok(id)
    }

    fn add_target(
        &mut self,
        parent: Option<NodeId>,
        spec: &Arc<TargetSpec>,
        source: &str,
        source_file: &str,
    ) -> Result<NodeId> {
        let (kind, params) = match spec.body() {
            Body::Func(body) => {
                let params = function_schema(spec.name(), body)?;
                (NodeKind::Func(body.func.clone()), params)
            }
            Body::Shell(template) => {
                let vars = extract_vars(template);
                let params = shell_schema(&vars);
                (
                    NodeKind::Shell {
                        template: template.clone(),
                        vars,
                    },
                    params,
                )
            }
            Body::None => (NodeKind::DepsOnly, Vec::new()),
        };

        check_schema_uniqueness(spec.name(), &params)?;

        let file = if spec.source_file().is_empty() {
            source_file
        } else {
            spec.source_file()
        };
        Ok(self.push_node(CommandNode {
            id: 0,
            parent,
            name: spec.name().to_string(),
            description: spec.description().to_string(),
            kind,
            params,
            config: spec.config().clone(),
            spec: Some(Arc::clone(spec)),
            children: IndexMap::new(),
            source_package: source.to_string(),
            source_file: file.to_string(),
        }))
    }

    fn push_node(&mut self, mut node: CommandNode) -> NodeId {
        let id = self.nodes.len();
        node.id = id;
        self.nodes.push(node);
        id
    }

    fn attach_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        let name = self.nodes[child].name.clone();
        if let Some(&existing) = self.nodes[parent].children.get(&name) {
            return Err(TargError::NameConflict {
                name,
                first: display_source(&self.nodes[existing].source_package),
                second: display_source(&self.nodes[child].source_package),
            });
        }
        self.nodes[parent].children.insert(name, child);
        Ok(())
    }

    /// A flag declared by a node must not shadow any ancestor's flag.
    fn check_flag_conflicts(&self) -> Result<()> {
        for node in &self.nodes {
            for ancestor in self.ancestors(node.id) {
                for decl in &node.params {
                    if decl.kind != ParamKind::Flag {
                        continue;
                    }
                    let clash = self.nodes[ancestor]
                        .params
                        .iter()
                        .any(|a| a.kind == ParamKind::Flag && a.name == decl.name);
                    if clash {
                        return Err(TargError::FlagConflict {
                            flag: decl.name.clone(),
                            node: self.path(node.id),
                            ancestor: format!("ancestor '{}'", self.path(ancestor)),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Attach a pre-built node for tests that need shapes the description
    /// layer cannot express (e.g. an executable node with children).
    #[cfg(test)]
    pub(crate) fn attach_for_test(
        &mut self,
        parent: Option<NodeId>,
        node: CommandNode,
    ) -> NodeId {
        let id = self.push_node(CommandNode { parent, ..node });
        match parent {
            Some(p) => {
                let name = self.nodes[id].name.clone();
                self.nodes[p].children.insert(name, id);
            }
            None => self.roots.push(id),
        }
        id
    }
}

/// Validate a function body's shape against its schema and apply the
/// metadata hook to each declaration.
pub(crate) fn function_schema(
    name: &str,
    body: &crate::target::FuncBody,
) -> Result<Vec<ParamDecl>> {
    if matches!(body.func, TargetFn::Nil) {
        return Err(TargError::NilFunction {
            target: name.to_string(),
        });
    }
    if body.func.takes_params() && body.params.is_empty() {
        return Err(TargError::InvalidFunctionSignature {
            target: name.to_string(),
            reason: "function takes a parameter record but declares no parameters".to_string(),
        });
    }
    if !body.func.takes_params() && !body.params.is_empty() {
        return Err(TargError::InvalidFunctionSignature {
            target: name.to_string(),
            reason: "function declares parameters but its shape does not accept them"
                .to_string(),
        });
    }

    let mut params = Vec::with_capacity(body.params.len());
    for decl in &body.params {
        let effective = match &body.meta_hook {
            Some(hook) => hook(&decl.name, decl.clone()).map_err(|reason| {
                TargError::InvalidArgument {
                    name: decl.name.clone(),
                    reason,
                }
            })?,
            None => decl.clone(),
        };
        params.push(effective);
    }
    Ok(params)
}

/// Extract `$var`/`${var}` names from a shell template: lowercased,
/// first-occurrence order, deduplicated.
#[must_use]
pub fn extract_vars(template: &str) -> Vec<String> {
    let mut vars = Vec::new();
    for cap in VAR_PATTERN.captures_iter(template) {
        let name = cap[1].to_ascii_lowercase();
        if !vars.contains(&name) {
            vars.push(name);
        }
    }
    vars
}

/// Synthesize the schema for a shell template: each variable becomes a
/// required string flag; short letters are the first character of the
/// variable, first-come-first-served.
pub(crate) fn shell_schema(vars: &[String]) -> Vec<ParamDecl> {
    let mut taken = Vec::new();
    vars.iter()
        .map(|var| {
            let mut decl = ParamDecl::flag(var).required();
            if let Some(first) = var.chars().next() {
                if !taken.contains(&first) {
                    taken.push(first);
                    decl = decl.short(first);
                }
            }
            decl
        })
        .collect()
}

/// Within one node, parameter names and short letters must be unique.
fn check_schema_uniqueness(target: &str, params: &[ParamDecl]) -> Result<()> {
    for (i, decl) in params.iter().enumerate() {
        for earlier in &params[..i] {
            if earlier.name == decl.name {
                return Err(TargError::FlagConflict {
                    flag: decl.name.clone(),
                    node: target.to_string(),
                    ancestor: "another parameter of the same target".to_string(),
                });
            }
            if decl.short.is_some() && earlier.short == decl.short {
                return Err(TargError::FlagConflict {
                    flag: format!("-{}", decl.short.unwrap_or_default()),
                    node: target.to_string(),
                    ancestor: format!("parameter --{}", earlier.name),
                });
            }
        }
    }
    Ok(())
}

fn display_source(source: &str) -> String {
    if source.is_empty() {
        "local".to_string()
    } else {
        source.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ValueKind;
    use crate::registry::Registry;
    use crate::target::{GroupSpec, TargetSpec};

    fn build_tree(members: Vec<Member>) -> Result<CommandTree> {
        let mut reg = Registry::new();
        reg.register(members);
        CommandTree::build(&reg.resolve()?.entries)
    }

    #[test]
    fn test_extract_vars_order_and_dedup() {
        let vars = extract_vars("kubectl apply -n $namespace -f ${FILE} --ns $NAMESPACE");
        assert_eq!(vars, vec!["namespace", "file"]);
    }

    #[test]
    fn test_extract_vars_none() {
        assert!(extract_vars("cargo build --release").is_empty());
    }

    #[test]
    fn test_shell_schema_short_letters_first_come() {
        let tree = build_tree(vec![Member::Target(
            TargetSpec::builder("deploy")
                .shell("kubectl apply -n $namespace -f $file --notes $note")
                .build()
                .unwrap(),
        )])
        .unwrap();

        let node = tree.node(tree.roots()[0]);
        assert!(matches!(node.kind, NodeKind::Shell { .. }));
        let shorts: Vec<_> = node.params.iter().map(|p| p.short).collect();
        // namespace takes 'n'; file takes 'f'; note wants 'n' but it is
        // taken, so it gets none.
        assert_eq!(shorts, vec![Some('n'), Some('f'), None]);
        assert!(node.params.iter().all(|p| p.required));
        assert!(node.params.iter().all(|p| p.value == ValueKind::Str));
    }

    #[test]
    fn test_group_nesting_and_paths() {
        let lint = TargetSpec::builder("lint").shell("cargo clippy").build().unwrap();
        let strict = TargetSpec::builder("strict")
            .shell("cargo clippy -- -D warnings")
            .build()
            .unwrap();
        let inner = GroupSpec::new("checks", vec![Member::Target(strict)]);
        let ci = GroupSpec::new(
            "ci",
            vec![Member::Target(lint), Member::Group(inner)],
        );

        let tree = build_tree(vec![Member::Group(ci)]).unwrap();
        let root = tree.roots()[0];
        assert!(tree.node(root).is_group());

        let lint_id = tree.find_child(root, "lint").unwrap();
        assert_eq!(tree.path(lint_id), "ci lint");

        let checks = tree.find_child(root, "checks").unwrap();
        let strict_id = tree.find_child(checks, "strict").unwrap();
        assert_eq!(tree.path(strict_id), "ci checks strict");
        assert_eq!(tree.ancestors(strict_id), vec![checks, root]);
    }

    #[test]
    fn test_duplicate_child_name_rejected() {
        let a = TargetSpec::builder("lint").shell("true").build().unwrap();
        let b = TargetSpec::builder("lint").shell("false").build().unwrap();
        let g = GroupSpec::new("ci", vec![Member::Target(a), Member::Target(b)]);
        assert!(matches!(
            build_tree(vec![Member::Group(g)]),
            Err(TargError::NameConflict { .. })
        ));
    }

    #[test]
    fn test_nil_function_rejected() {
        let spec = TargetSpec::builder("broken")
            .func(crate::target::FuncBody {
                func: TargetFn::Nil,
                params: Vec::new(),
                meta_hook: None,
            })
            .build()
            .unwrap();
        assert!(matches!(
            build_tree(vec![Member::Target(spec)]),
            Err(TargError::NilFunction { .. })
        ));
    }

    #[test]
    fn test_signature_shape_mismatches_rejected() {
        // Params-taking shape with an empty schema.
        let spec = TargetSpec::builder("a")
            .func(crate::target::FuncBody {
                func: TargetFn::Params(std::sync::Arc::new(|_| Ok(()))),
                params: Vec::new(),
                meta_hook: None,
            })
            .build()
            .unwrap();
        assert!(matches!(
            build_tree(vec![Member::Target(spec)]),
            Err(TargError::InvalidFunctionSignature { .. })
        ));

        // Paramless shape with a schema attached.
        let spec = TargetSpec::builder("b")
            .func(crate::target::FuncBody {
                func: TargetFn::Plain(std::sync::Arc::new(|| Ok(()))),
                params: vec![ParamDecl::flag("name")],
                meta_hook: None,
            })
            .build()
            .unwrap();
        assert!(matches!(
            build_tree(vec![Member::Target(spec)]),
            Err(TargError::InvalidFunctionSignature { .. })
        ));
    }

    #[test]
    fn test_meta_hook_applied() {
        let hook: crate::params::MetaHook = std::sync::Arc::new(|field, decl| {
            if field == "name" {
                Ok(decl.default_value("computed"))
            } else {
                Ok(decl)
            }
        });
        let spec = TargetSpec::builder("greet")
            .func(crate::target::FuncBody {
                func: TargetFn::Params(std::sync::Arc::new(|_| Ok(()))),
                params: vec![ParamDecl::flag("name")],
                meta_hook: Some(hook),
            })
            .build()
            .unwrap();

        let tree = build_tree(vec![Member::Target(spec)]).unwrap();
        let node = tree.node(tree.roots()[0]);
        assert_eq!(node.params[0].default.as_deref(), Some("computed"));
    }

    #[test]
    fn test_duplicate_param_names_rejected() {
        let spec = TargetSpec::builder("x")
            .run_params(
                vec![ParamDecl::flag("name"), ParamDecl::flag("name")],
                |_| Ok(()),
            )
            .build()
            .unwrap();
        assert!(matches!(
            build_tree(vec![Member::Target(spec)]),
            Err(TargError::FlagConflict { .. })
        ));
    }

    #[test]
    fn test_duplicate_shorts_rejected() {
        let spec = TargetSpec::builder("x")
            .run_params(
                vec![
                    ParamDecl::flag("name").short('n'),
                    ParamDecl::flag("notes").short('n'),
                ],
                |_| Ok(()),
            )
            .build()
            .unwrap();
        assert!(matches!(
            build_tree(vec![Member::Target(spec)]),
            Err(TargError::FlagConflict { .. })
        ));
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let tree = build_tree(vec![Member::Target(
            TargetSpec::builder("build").shell("true").build().unwrap(),
        )])
        .unwrap();
        assert!(tree.find_root("BUILD").is_some());
        assert!(tree.find_root("Build").is_some());
        assert!(tree.find_root("built").is_none());
    }

    #[test]
    fn test_ancestor_flag_conflict_fatal() {
        // An executable node with children cannot come from descriptions,
        // so build the shape directly.
        let mut tree = CommandTree::default();
        let parent = tree.attach_for_test(
            None,
            CommandNode {
                id: 0,
                parent: None,
                name: "serve".to_string(),
                description: String::new(),
                kind: NodeKind::Func(TargetFn::Params(std::sync::Arc::new(|_| Ok(())))),
                params: vec![ParamDecl::flag("verbose")],
                config: RunConfig::default(),
                spec: None,
                children: IndexMap::new(),
                source_package: String::new(),
                source_file: String::new(),
            },
        );
        tree.attach_for_test(
            Some(parent),
            CommandNode {
                id: 0,
                parent: None,
                name: "api".to_string(),
                description: String::new(),
                kind: NodeKind::Func(TargetFn::Params(std::sync::Arc::new(|_| Ok(())))),
                params: vec![ParamDecl::flag("verbose")],
                config: RunConfig::default(),
                spec: None,
                children: IndexMap::new(),
                source_package: String::new(),
                source_file: String::new(),
            },
        );
        assert!(matches!(
            tree.check_flag_conflicts(),
            Err(TargError::FlagConflict { .. })
        ));
    }
}
