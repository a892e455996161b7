#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod alert;
pub mod event;
pub mod pattern;
pub mod policy;
pub mod store;

pub use self::{
    alert::{AlertRule, Channel, ChannelType},
    event::{Actor, ChangeEvent, Decision, Mutation, Operation, Subject, UnknownOperation},
    pattern::{InvalidPattern, Pattern, PatternRule},
    policy::PolicyConfig,
    store::{EventFilter, MemoryStore, Store},
};

pub const CONTROLLER_NAME: &str = "kubetrail.io/audit-controller";
