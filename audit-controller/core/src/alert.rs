use crate::{
    event::Subject,
    pattern::{PatternRule, Scope},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Binds a match predicate to a notification channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub name: String,

    #[serde(default, rename = "match")]
    pub match_criteria: PatternRule,

    pub channel: Channel,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    #[serde(rename = "type")]
    pub channel_type: ChannelType,

    pub target: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Webhook,
}

impl AlertRule {
    pub fn matches<S>(&self, subject: &S) -> bool
    where
        S: Subject + ?Sized,
    {
        self.match_criteria.matches(subject, Scope::Alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Actor, Mutation, Operation};

    #[test]
    fn parses_webhook_rules() {
        let rules: Vec<AlertRule> = serde_yaml::from_str(
            r#"
- name: prod-changes
  match:
    namespace: prod
  channel:
    type: webhook
    target: https://hooks.example.com/kubetrail
    headers:
      Authorization: Bearer abc
- name: everything
  channel:
    type: webhook
    target: http://127.0.0.1:9000/
"#,
        )
        .unwrap();

        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].channel.channel_type, ChannelType::Webhook);
        assert_eq!(
            rules[0].channel.headers.get("Authorization").map(String::as_str),
            Some("Bearer abc")
        );
        assert_eq!(rules[1].match_criteria, PatternRule::default());

        let m = Mutation {
            timestamp: None,
            kind: "Deployment".to_string(),
            namespace: "prod".to_string(),
            name: "web".to_string(),
            operation: Operation::Create,
            actor: Actor::default(),
            old_object: None,
            new_object: None,
            source_ip: None,
            user_agent: None,
        };
        assert!(rules[0].matches(&m));
        assert!(rules[1].matches(&m));
    }

    #[test]
    fn rejects_unknown_channel_types() {
        let res = serde_yaml::from_str::<AlertRule>(
            "name: x\nchannel: {type: carrier-pigeon, target: coop}",
        );
        assert!(res.is_err());
    }
}
