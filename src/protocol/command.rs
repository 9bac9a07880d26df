//! Command table and outbound encoding.
//!
//! Every device command is a literal ASCII payload (the unit number and checksum
//! are baked into the literal) followed by CR LF. The table is immutable once
//! built; configuration may override payloads at startup only.

use crate::error::{AppResult, PrealignError};
use crate::hardware::LinkKind;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Line terminator appended to every outbound command.
pub const TERMINATOR: &[u8] = b"\r\n";

/// Four-character command tag echoed by the device in completion frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandTag {
    /// Move to ready station
    Mtrs,
    /// Align wafer
    Maln,
    /// Chuck solenoid (chuck hold)
    Csol,
    /// Hardware reset
    Hrst,
    /// Clear alarm / error state
    Cclr,
    /// Emergency stop
    Cemg,
}

impl CommandTag {
    /// All known tags.
    pub const ALL: [CommandTag; 6] = [
        CommandTag::Mtrs,
        CommandTag::Maln,
        CommandTag::Csol,
        CommandTag::Hrst,
        CommandTag::Cclr,
        CommandTag::Cemg,
    ];

    /// Wire spelling of the tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandTag::Mtrs => "MTRS",
            CommandTag::Maln => "MALN",
            CommandTag::Csol => "CSOL",
            CommandTag::Hrst => "HRST",
            CommandTag::Cclr => "CCLR",
            CommandTag::Cemg => "CEMG",
        }
    }

    /// Parse a 4-character wire tag.
    pub fn from_wire(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

impl std::fmt::Display for CommandTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the command table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEntry {
    /// Canonical symbolic name (upper case).
    pub name: String,
    /// Literal wire payload, without terminator.
    pub payload: String,
    /// Link the command travels on.
    pub link: LinkKind,
    /// Tag the device echoes on completion, for serial commands.
    pub tag: Option<CommandTag>,
}

static DEFAULT_COMMANDS: &[(&str, &str, LinkKind, Option<CommandTag>)] = &[
    ("MTRS", "$2MTRSG100ALDD", LinkKind::Serial, Some(CommandTag::Mtrs)),
    ("MALN", "$2MALN1009000B4", LinkKind::Serial, Some(CommandTag::Maln)),
    ("CSOL", "$2CSOLA0D4", LinkKind::Serial, Some(CommandTag::Csol)),
    ("HRST", "$1HRST72", LinkKind::Serial, Some(CommandTag::Hrst)),
    ("CCLR", "$2CCLRE9B", LinkKind::Serial, Some(CommandTag::Cclr)),
    ("CEMG", "$2CEMG4E", LinkKind::Serial, Some(CommandTag::Cemg)),
    ("T1", "T1", LinkKind::Vision, None),
    ("T2", "T2", LinkKind::Vision, None),
    ("PREVCAMERA", "FW,PV", LinkKind::Vision, None),
    ("NEXTCAMERA", "FW,NX", LinkKind::Vision, None),
];

static ALIASES: &[(&str, &str)] = &[("CHUCKHOLD", "CSOL"), ("EMERGENCYSTOP", "CEMG")];

/// Process-wide table mapping symbolic names to wire payloads.
///
/// Lookups are case-insensitive and accept the aliases `ChuckHold` (CSOL) and
/// `EmergencyStop` (CEMG).
#[derive(Debug, Clone)]
pub struct CommandTable {
    entries: BTreeMap<String, CommandEntry>,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl CommandTable {
    /// The factory command set of the prealigner and vision system.
    pub fn standard() -> Self {
        let entries = DEFAULT_COMMANDS
            .iter()
            .map(|(name, payload, link, tag)| {
                (
                    name.to_string(),
                    CommandEntry {
                        name: name.to_string(),
                        payload: payload.to_string(),
                        link: *link,
                        tag: *tag,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// Replace payloads for existing names.
    ///
    /// Only payloads may change; a name absent from the table is an error.
    pub fn with_overrides(mut self, overrides: &HashMap<String, String>) -> AppResult<Self> {
        for (name, payload) in overrides {
            let key = Self::canonical(name);
            let entry = self
                .entries
                .get_mut(&key)
                .ok_or_else(|| PrealignError::UnknownCommand(name.clone()))?;
            entry.payload = payload.clone();
        }
        Ok(self)
    }

    fn canonical(name: &str) -> String {
        let upper = name.trim().to_ascii_uppercase();
        ALIASES
            .iter()
            .find(|(alias, _)| *alias == upper)
            .map(|(_, target)| target.to_string())
            .unwrap_or(upper)
    }

    /// Look up an entry by symbolic name.
    pub fn entry(&self, name: &str) -> AppResult<&CommandEntry> {
        self.entries
            .get(&Self::canonical(name))
            .ok_or_else(|| PrealignError::UnknownCommand(name.to_string()))
    }

    /// Entry for a serial command tag.
    pub fn for_tag(&self, tag: CommandTag) -> AppResult<&CommandEntry> {
        self.entry(tag.as_str())
    }

    /// Encode a named command: payload followed by CR LF.
    pub fn encode(&self, name: &str) -> AppResult<Bytes> {
        Ok(encode_raw(&self.entry(name)?.payload))
    }

    /// Iterate entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = &CommandEntry> {
        self.entries.values()
    }
}

/// Encode raw user text verbatim, appending the terminator.
pub fn encode_raw(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(text.len() + TERMINATOR.len());
    buf.put_slice(text.as_bytes());
    buf.put_slice(TERMINATOR);
    buf.freeze()
}
