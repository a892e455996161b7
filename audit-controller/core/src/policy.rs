use crate::{
    event::Subject,
    pattern::{self, PatternRule, Scope},
};
use serde::{Deserialize, Serialize};

/// An immutable snapshot of the active ignore and block rules.
///
/// Snapshots are never updated in place: an update builds a new config and
/// publishes it as a whole.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyConfig {
    #[serde(default, alias = "ignoreRules")]
    pub ignore: Vec<PatternRule>,

    #[serde(default, alias = "blockRules")]
    pub block: Vec<PatternRule>,
}

impl PolicyConfig {
    /// Returns the first block rule that matches the subject, if any.
    pub fn blocking_rule<S>(&self, subject: &S) -> Option<&PatternRule>
    where
        S: Subject + ?Sized,
    {
        pattern::first_match(&self.block, subject, Scope::Block)
    }

    pub fn is_ignored<S>(&self, subject: &S) -> bool
    where
        S: Subject + ?Sized,
    {
        pattern::matches(&self.ignore, subject, Scope::Ignore)
    }

    pub fn with_ignore(&self, ignore: Vec<PatternRule>) -> Self {
        Self {
            ignore,
            block: self.block.clone(),
        }
    }

    pub fn with_block(&self, block: Vec<PatternRule>) -> Self {
        Self {
            ignore: self.ignore.clone(),
            block,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Actor, Mutation, Operation};

    fn mk(ns: &str, op: Operation) -> Mutation {
        Mutation {
            timestamp: None,
            kind: "ConfigMap".to_string(),
            namespace: ns.to_string(),
            name: "foo".to_string(),
            operation: op,
            actor: Actor::default(),
            old_object: None,
            new_object: None,
            source_ip: None,
            user_agent: None,
        }
    }

    #[test]
    fn empty_config_neither_blocks_nor_ignores() {
        let config = PolicyConfig::default();
        for op in Operation::ALL {
            let m = mk("kube-system", op);
            assert!(config.blocking_rule(&m).is_none());
            assert!(!config.is_ignored(&m));
        }
    }

    #[test]
    fn parses_yaml() {
        let config: PolicyConfig = serde_yaml::from_str(
            r#"
ignore:
- namespace: default
block:
- namespace: kube-system
  operation: Delete
"#,
        )
        .unwrap();

        assert!(config.is_ignored(&mk("default", Operation::Update)));
        assert!(!config.is_ignored(&mk("prod", Operation::Update)));

        let rule = config
            .blocking_rule(&mk("kube-system", Operation::Delete))
            .expect("delete in kube-system must be blocked");
        assert_eq!(rule.to_string(), "[namespace=kube-system, operation=Delete]");
        assert!(config.blocking_rule(&mk("kube-system", Operation::Update)).is_none());
    }

    #[test]
    fn accepts_long_field_names() {
        let config: PolicyConfig =
            serde_yaml::from_str("ignoreRules: [{namespace: a}]\nblockRules: []").unwrap();
        assert_eq!(config.ignore.len(), 1);
        assert!(config.block.is_empty());
    }

    #[test]
    fn replacing_one_list_keeps_the_other() {
        let config: PolicyConfig =
            serde_yaml::from_str("ignore: [{namespace: a}]\nblock: [{namespace: b}]").unwrap();
        let updated = config.with_ignore(vec![]);
        assert!(updated.ignore.is_empty());
        assert_eq!(updated.block, config.block);
        assert_eq!(config.ignore.len(), 1);
    }
}
