#![forbid(unsafe_code)]

// Room polls: ordered list, one recorded selection per voter key.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct Poll {
    pub question: String,
    pub options: Vec<String>,
    /// voter key (stable peer uuid) -> selected option
    voters: HashMap<String, String>,
}

/// Serializable view of a poll, voters flattened for the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollView {
    pub question: String,
    pub options: Vec<String>,
    pub voters: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct PollSet {
    polls: Vec<Poll>,
}

impl PollSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, question: String, options: Vec<String>) {
        self.polls.push(Poll {
            question,
            options,
            voters: HashMap::new(),
        });
    }

    /// Records one selection per distinct voter key, overwriting any prior
    /// vote by the same key. Out-of-range index is a no-op.
    pub fn vote(&mut self, index: usize, voter_key: &str, option: String) {
        if let Some(poll) = self.polls.get_mut(index) {
            poll.voters.insert(voter_key.to_string(), option);
        }
    }

    /// Out-of-range index is a no-op.
    pub fn edit(&mut self, index: usize, question: String, options: Vec<String>) {
        if let Some(poll) = self.polls.get_mut(index) {
            poll.question = question;
            poll.options = options;
        }
    }

    /// Out-of-range index is a no-op.
    pub fn delete(&mut self, index: usize) {
        if index < self.polls.len() {
            self.polls.remove(index);
        }
    }

    pub fn len(&self) -> usize {
        self.polls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polls.is_empty()
    }

    pub fn views(&self) -> Vec<PollView> {
        self.polls
            .iter()
            .map(|p| PollView {
                question: p.question.clone(),
                options: p.options.clone(),
                voters: p.voters.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_overwrites_prior_selection() {
        let mut polls = PollSet::new();
        polls.add("lunch?".into(), vec!["pizza".into(), "sushi".into()]);

        polls.vote(0, "u1", "pizza".into());
        polls.vote(0, "u1", "sushi".into());
        polls.vote(0, "u2", "pizza".into());

        let views = polls.views();
        assert_eq!(views[0].voters.len(), 2);
        assert_eq!(views[0].voters.get("u1"), Some(&"sushi".to_string()));
    }

    #[test]
    fn out_of_range_operations_are_noops() {
        let mut polls = PollSet::new();
        polls.add("q".into(), vec!["a".into()]);

        polls.vote(5, "u1", "a".into());
        polls.edit(5, "new".into(), vec![]);
        polls.delete(5);

        assert_eq!(polls.len(), 1);
        assert!(polls.views()[0].voters.is_empty());
        assert_eq!(polls.views()[0].question, "q");
    }

    #[test]
    fn edit_and_delete_by_index() {
        let mut polls = PollSet::new();
        polls.add("first".into(), vec!["a".into()]);
        polls.add("second".into(), vec!["b".into()]);

        polls.edit(0, "updated".into(), vec!["x".into(), "y".into()]);
        assert_eq!(polls.views()[0].question, "updated");
        assert_eq!(polls.views()[0].options.len(), 2);

        polls.delete(0);
        assert_eq!(polls.len(), 1);
        assert_eq!(polls.views()[0].question, "second");
    }
}
