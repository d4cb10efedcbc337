//! Structural validation and the precomputed jump table used by playback.

use thiserror::Error;

use crate::action::{Action, ActionKind, ValidationError};

#[derive(Debug, Error, PartialEq)]
pub enum StructureError {
    #[error("action {index}: {source}")]
    Invalid {
        index: usize,
        #[source]
        source: ValidationError,
    },
    #[error("mismatched loop at action {index}: loop_end '{found}' closes loop '{expected}'")]
    MismatchedLoop {
        index: usize,
        expected: String,
        found: String,
    },
    #[error("loop_end '{name}' at action {index} has no open loop")]
    UnopenedLoop { index: usize, name: String },
    #[error("loop '{name}' started at action {index} is never closed")]
    UnclosedLoop { index: usize, name: String },
    #[error("{kind} at action {index} has no open if_color_start")]
    UnopenedIf { index: usize, kind: &'static str },
    #[error("second else at action {index} for if_color_start at action {start}")]
    DuplicateElse { index: usize, start: usize },
    #[error("if_color_start at action {index} is never closed")]
    UnclosedIf { index: usize },
    #[error("{kind} at action {index} crosses the block opened at action {open}")]
    CrossedBlock {
        index: usize,
        open: usize,
        kind: &'static str,
    },
}

/// Where control goes from a block marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Jump {
    None,
    /// `loop_start` -> its `loop_end`.
    LoopEnd(usize),
    /// `loop_end` -> its `loop_start`.
    LoopStart(usize),
    /// `if_color_start` -> optional `else` and the `if_end`.
    If { else_at: Option<usize>, end: usize },
    /// `else` -> its `if_end`.
    Else { end: usize },
}

#[derive(Clone, Debug)]
pub struct Program {
    actions: Vec<Action>,
    jumps: Vec<Jump>,
}

enum Open {
    Loop { index: usize },
    If { index: usize, else_at: Option<usize> },
}

impl Program {
    /// Validates every action and the block nesting, then records the
    /// matching partner of every block marker.
    pub fn compile(actions: Vec<Action>) -> Result<Self, StructureError> {
        for (index, action) in actions.iter().enumerate() {
            action
                .validate()
                .map_err(|source| StructureError::Invalid { index, source })?;
        }

        let mut jumps = vec![Jump::None; actions.len()];
        let mut open: Vec<Open> = Vec::new();

        for (index, action) in actions.iter().enumerate() {
            match &action.kind {
                ActionKind::LoopStart { .. } => open.push(Open::Loop { index }),
                ActionKind::LoopEnd { name } => match open.pop() {
                    Some(Open::Loop { index: start }) => {
                        let expected = loop_name(&actions[start]);
                        if expected != name {
                            return Err(StructureError::MismatchedLoop {
                                index,
                                expected: expected.to_string(),
                                found: name.clone(),
                            });
                        }
                        jumps[start] = Jump::LoopEnd(index);
                        jumps[index] = Jump::LoopStart(start);
                    }
                    Some(Open::If { index: open, .. }) => {
                        return Err(StructureError::CrossedBlock {
                            index,
                            open,
                            kind: "loop_end",
                        });
                    }
                    None => {
                        return Err(StructureError::UnopenedLoop {
                            index,
                            name: name.clone(),
                        });
                    }
                },
                ActionKind::IfColorStart { .. } => open.push(Open::If {
                    index,
                    else_at: None,
                }),
                ActionKind::Else => match open.last_mut() {
                    Some(Open::If { index: start, else_at }) => {
                        if else_at.is_some() {
                            return Err(StructureError::DuplicateElse {
                                index,
                                start: *start,
                            });
                        }
                        *else_at = Some(index);
                    }
                    Some(Open::Loop { index: open }) => {
                        return Err(StructureError::CrossedBlock {
                            index,
                            open: *open,
                            kind: "else",
                        });
                    }
                    None => return Err(StructureError::UnopenedIf { index, kind: "else" }),
                },
                ActionKind::IfEnd => match open.pop() {
                    Some(Open::If {
                        index: start,
                        else_at,
                    }) => {
                        jumps[start] = Jump::If { else_at, end: index };
                        if let Some(else_index) = else_at {
                            jumps[else_index] = Jump::Else { end: index };
                        }
                    }
                    Some(Open::Loop { index: open }) => {
                        return Err(StructureError::CrossedBlock {
                            index,
                            open,
                            kind: "if_end",
                        });
                    }
                    None => {
                        return Err(StructureError::UnopenedIf {
                            index,
                            kind: "if_end",
                        });
                    }
                },
                _ => {}
            }
        }

        if let Some(block) = open.pop() {
            return Err(match block {
                Open::Loop { index } => StructureError::UnclosedLoop {
                    index,
                    name: loop_name(&actions[index]).to_string(),
                },
                Open::If { index, .. } => StructureError::UnclosedIf { index },
            });
        }

        Ok(Program { actions, jumps })
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn jump(&self, index: usize) -> Jump {
        self.jumps.get(index).copied().unwrap_or(Jump::None)
    }
}

fn loop_name(action: &Action) -> &str {
    match &action.kind {
        ActionKind::LoopStart { name, .. } | ActionKind::LoopEnd { name } => name,
        _ => "",
    }
}
