//! OpenFlow flows and the flow table edits that turn one set of flows into another.

use super::ofpact::{Ofpact, Ofpacts};

use std::collections::BTreeMap;
use std::fmt;

/// One OpenFlow flow: a match and actions at a priority in a table.
///
/// The match is kept in `ovs-ofctl` syntax, e.g. `metadata=0x1,reg14=0x2,ip`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Flow {
    pub table_id: u8,
    pub priority: u16,
    pub cookie: u64,
    pub match_: String,
    pub actions: Vec<Ofpact>,
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "table={}, priority={}, cookie={:#x}, ", self.table_id, self.priority, self.cookie)?;
        if !self.match_.is_empty() {
            write!(f, "{} ", self.match_)?;
        }
        write!(f, "actions={}", Ofpacts(&self.actions))
    }
}

const OFPFC_ADD: u8 = 0;
const OFPFC_MODIFY: u8 = 1;
const OFPFC_MODIFY_STRICT: u8 = 2;
const OFPFC_DELETE: u8 = 3;
const OFPFC_DELETE_STRICT: u8 = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlowModCommand {
    Add,
    Modify { strict: bool },
    Delete { strict: bool }
}

impl FlowModCommand {
    pub fn to_openflow(&self) -> u8 {
        match self {
            FlowModCommand::Add => OFPFC_ADD,
            FlowModCommand::Modify { strict: false } => OFPFC_MODIFY,
            FlowModCommand::Modify { strict: true } => OFPFC_MODIFY_STRICT,
            FlowModCommand::Delete { strict: false } => OFPFC_DELETE,
            FlowModCommand::Delete { strict: true } => OFPFC_DELETE_STRICT
        }
    }
}

impl fmt::Display for FlowModCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            FlowModCommand::Add => "add",
            FlowModCommand::Modify { strict: false } => "modify",
            FlowModCommand::Modify { strict: true } => "modify_strict",
            FlowModCommand::Delete { strict: false } => "delete",
            FlowModCommand::Delete { strict: true } => "delete_strict",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowMod {
    pub command: FlowModCommand,
    pub flow: Flow,
}

impl fmt::Display for FlowMod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.command, self.flow)
    }
}

/// Returns the flow mods that change a flow table containing `old` into one containing `new`.
///
/// Flows are identified by table, priority, and match, as OpenFlow does for strict operations.
/// Deletions come first, then modifications, then additions.
pub fn flow_mods(old: &[Flow], new: &[Flow]) -> Vec<FlowMod> {
    fn index(flows: &[Flow]) -> BTreeMap<(u8, u16, String), Flow> {
        flows.iter()
            .map(|flow| ((flow.table_id, flow.priority, flow.match_.clone()), flow.clone()))
            .collect()
    }
    let old = index(old);
    let new = index(new);

    let mut deletes = Vec::new();
    let mut modifies = Vec::new();
    let mut adds = Vec::new();
    for (k, flow) in &old {
        if !new.contains_key(k) {
            deletes.push(FlowMod { command: FlowModCommand::Delete { strict: true }, flow: flow.clone() });
        }
    }
    for (k, flow) in &new {
        match old.get(k) {
            None => adds.push(FlowMod { command: FlowModCommand::Add, flow: flow.clone() }),
            Some(old_flow) if old_flow.actions != flow.actions || old_flow.cookie != flow.cookie =>
                modifies.push(FlowMod { command: FlowModCommand::Modify { strict: true }, flow: flow.clone() }),
            Some(_) => (),
        }
    }
    deletes.into_iter().chain(modifies).chain(adds).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(priority: u16, match_: &str, actions: Vec<Ofpact>) -> Flow {
        Flow { table_id: 16, priority, cookie: 0, match_: match_.into(), actions }
    }

    #[test]
    fn diff_flow_tables() {
        let old = vec![flow(100, "metadata=0x1", vec![]),
                       flow(50, "metadata=0x1,reg14=0x1", vec![Ofpact::DecTtl])];
        let new = vec![flow(50, "metadata=0x1,reg14=0x1", vec![Ofpact::Resubmit { table: 17 }]),
                       flow(0, "metadata=0x1", vec![Ofpact::Resubmit { table: 17 }])];
        let mods = flow_mods(&old, &new);
        let commands: Vec<FlowModCommand> = mods.iter().map(|fm| fm.command).collect();
        assert_eq!(commands, vec![FlowModCommand::Delete { strict: true },
                                  FlowModCommand::Modify { strict: true },
                                  FlowModCommand::Add]);
        assert_eq!(mods[2].to_string(),
                   "add table=16, priority=0, cookie=0x0, metadata=0x1 actions=resubmit(,17)");
        assert!(flow_mods(&new, &new).is_empty());
    }
}
