//! Tab-completion support.
//!
//! The reserved `__complete` subcommand receives the words typed so far
//! and prints one candidate per line: command names at the current tree
//! level plus the current node's flags. `--completion [shell]` emits a
//! small static script that delegates to `__complete`, so the candidates
//! always reflect the registered targets.

use crate::params::ParamKind;
use crate::tree::{CommandTree, NodeId};

/// Candidates for the partial word at the end of `words`.
#[must_use]
pub fn candidates(tree: &CommandTree, words: &[String]) -> Vec<String> {
    let (walked, partial) = match words.split_last() {
        Some((last, rest)) => (rest, last.as_str()),
        None => (&[] as &[String], ""),
    };

    // Walk completed words down the tree, resetting on `^`.
    let mut current: Option<NodeId> = None;
    for word in walked {
        if word == crate::chain::RESET_TOKEN {
            current = None;
            continue;
        }
        if word.starts_with('-') {
            continue;
        }
        current = match current {
            None => tree.find_root(word),
            Some(id) => tree
                .find_child(id, word)
                .or_else(|| tree.find_sibling(id, word)),
        };
        if current.is_none() {
            break;
        }
    }

    let mut out = Vec::new();
    if partial.starts_with('-') {
        if let Some(id) = current {
            for decl in &tree.node(id).params {
                if decl.kind == ParamKind::Flag {
                    let flag = format!("--{}", decl.name);
                    if flag.starts_with(partial) {
                        out.push(flag);
                    }
                }
            }
        }
        return out;
    }

    let names: Vec<NodeId> = match current {
        None => tree.roots().to_vec(),
        Some(id) => tree.node(id).children.values().copied().collect(),
    };
    let partial_lower = partial.to_ascii_lowercase();
    for id in names {
        let name = &tree.node(id).name;
        if name.to_ascii_lowercase().starts_with(&partial_lower) {
            out.push(name.clone());
        }
    }
    out
}

/// A completion script for the given shell, delegating to `__complete`.
/// Returns `None` for unsupported shells.
#[must_use]
pub fn completion_script(shell: &str, bin: &str) -> Option<String> {
    match shell {
        "bash" => Some(format!(
            r#"_{bin}_complete() {{
    local cur="${{COMP_WORDS[COMP_CWORD]}}"
    COMPREPLY=($(compgen -W "$({bin} __complete "${{COMP_WORDS[@]:1}}")" -- "$cur"))
}}
complete -F _{bin}_complete {bin}
"#
        )),
        "zsh" => Some(format!(
            r#"#compdef {bin}
_{bin}_complete() {{
    compadd -- $({bin} __complete "${{words[@]:1}}")
}}
compdef _{bin}_complete {bin}
"#
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::target::{GroupSpec, Member, TargetSpec};

    fn fixture() -> CommandTree {
        let build = TargetSpec::builder("build").shell("true").build().unwrap();
        let bench = TargetSpec::builder("bench").shell("true").build().unwrap();
        let deploy = TargetSpec::builder("deploy")
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
        reg.register([
            Member::Target(build),
            Member::Target(bench),
            Member::Target(deploy),
            Member::Group(ci),
        ]);
        CommandTree::build(&reg.resolve().unwrap().entries).unwrap()
    }

    fn words(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_root_name_candidates() {
        let tree = fixture();
        assert_eq!(candidates(&tree, &words(&["b"])), vec!["build", "bench"]);
        assert_eq!(candidates(&tree, &words(&[""])).len(), 4);
    }

    #[test]
    fn test_child_candidates_after_group() {
        let tree = fixture();
        assert_eq!(candidates(&tree, &words(&["ci", "l"])), vec!["lint"]);
    }

    #[test]
    fn test_flag_candidates() {
        let tree = fixture();
        assert_eq!(
            candidates(&tree, &words(&["deploy", "--n"])),
            vec!["--namespace"]
        );
        assert_eq!(candidates(&tree, &words(&["deploy", "--"])).len(), 2);
    }

    #[test]
    fn test_reset_token_returns_to_roots() {
        let tree = fixture();
        assert_eq!(
            candidates(&tree, &words(&["ci", "^", "b"])),
            vec!["build", "bench"]
        );
    }

    #[test]
    fn test_scripts_reference_complete_subcommand() {
        let bash = completion_script("bash", "targ").unwrap();
        assert!(bash.contains("__complete"));
        let zsh = completion_script("zsh", "targ").unwrap();
        assert!(zsh.contains("__complete"));
        assert!(completion_script("tcsh", "targ").is_none());
    }
}
