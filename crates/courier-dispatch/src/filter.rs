//! Address/action endpoint filtering.

use std::collections::HashSet;

use courier_protocol::{EndpointAddress, Fault, Message, actions};

/// Outcome of matching a message against the endpoint table.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterMatch {
    /// Index of the single endpoint accepting the message.
    Endpoint(usize),
    Ambiguous(Fault),
    /// No endpoint listens on the destination address.
    AddressMismatch,
    /// Endpoints listen on the address, but none handles the action.
    ActionMismatch,
}

pub trait EndpointFilterTable: Send + Sync {
    fn match_message(&self, message: &Message) -> FilterMatch;
}

struct FilterEntry {
    address: EndpointAddress,
    actions: HashSet<String>,
    any_action: bool,
}

/// Exact address and action matching.
///
/// A message without a destination matches every address. The session
/// opened notification matches every endpoint's actions.
#[derive(Default)]
pub struct ExactFilterTable {
    entries: Vec<FilterEntry>,
}

impl ExactFilterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the next endpoint; its index is the registration order.
    pub fn add_endpoint(
        &mut self,
        address: EndpointAddress,
        actions: impl IntoIterator<Item = String>,
        any_action: bool,
    ) -> usize {
        self.entries.push(FilterEntry {
            address,
            actions: actions.into_iter().collect(),
            any_action,
        });
        self.entries.len() - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl EndpointFilterTable for ExactFilterTable {
    fn match_message(&self, message: &Message) -> FilterMatch {
        let to = message.headers.to.as_ref();
        let by_address: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| to.is_none_or(|to| *to == entry.address))
            .map(|(index, _)| index)
            .collect();
        if by_address.is_empty() {
            return FilterMatch::AddressMismatch;
        }

        let action = message.action();
        let matched: Vec<usize> = by_address
            .into_iter()
            .filter(|&index| {
                let entry = &self.entries[index];
                entry.any_action || action == actions::SESSION_OPENED || entry.actions.contains(action)
            })
            .collect();
        match matched.as_slice() {
            [] => FilterMatch::ActionMismatch,
            [index] => FilterMatch::Endpoint(*index),
            _ => {
                let to = to.map_or("", EndpointAddress::as_str);
                FilterMatch::Ambiguous(Fault::multiple_endpoints_matched(to))
            }
        }
    }
}
