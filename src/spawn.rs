//! Spawn prompt schema.
//!
//! A spawn prompt carries instructions from a parent WU to a spawned child
//! agent through channels that may mangle text (shell quoting, templating,
//! copy-paste). The serialised form brackets the content with sentinels and
//! embeds a sha256 checksum, so any mutation in transit is detected at parse
//! time instead of silently mis-instructing the child.

use sha2::{Digest, Sha256};

use crate::error::{LumenError, Result};
use crate::wu::WuId;

const SPAWN_BEGIN: &str = "SPAWN_BEGIN";
const SPAWN_END: &str = "SPAWN_END";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnPrompt {
    pub wu_id: WuId,
    pub content: String,
}

fn checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl SpawnPrompt {
    pub fn new(wu_id: WuId, content: impl Into<String>) -> Self {
        Self {
            wu_id,
            content: content.into(),
        }
    }

    /// Render the wire form:
    ///
    /// ```text
    /// SPAWN_BEGIN WU-7 <sha256-of-content>
    /// <content>
    /// SPAWN_END
    /// ```
    pub fn serialize(&self) -> String {
        format!(
            "{SPAWN_BEGIN} {} {}\n{}\n{SPAWN_END}\n",
            self.wu_id,
            checksum(&self.content),
            self.content
        )
    }

    /// Parse and verify a wire-form prompt.
    ///
    /// Fails on a missing `SPAWN_BEGIN` header, a missing `SPAWN_END`
    /// sentinel, or a checksum mismatch (any mutation of the content after
    /// serialisation).
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let header = lines
            .next()
            .ok_or_else(|| LumenError::validation(None, "empty spawn prompt"))?;

        let mut parts = header.split_whitespace();
        if parts.next() != Some(SPAWN_BEGIN) {
            return Err(LumenError::validation(
                None,
                format!("spawn prompt missing {SPAWN_BEGIN} header"),
            ));
        }
        let wu_id: WuId = parts
            .next()
            .ok_or_else(|| LumenError::validation(None, "spawn header missing WU id"))?
            .parse()
            .map_err(|e: String| LumenError::validation(None, e))?;
        let expected_checksum = parts
            .next()
            .ok_or_else(|| LumenError::validation(Some(wu_id), "spawn header missing checksum"))?
            .to_string();

        let mut content_lines: Vec<&str> = Vec::new();
        let mut terminated = false;
        for line in lines {
            if line == SPAWN_END {
                terminated = true;
                break;
            }
            content_lines.push(line);
        }
        if !terminated {
            return Err(LumenError::validation(
                Some(wu_id),
                format!("spawn prompt missing {SPAWN_END} sentinel"),
            ));
        }

        let content = content_lines.join("\n");
        if checksum(&content) != expected_checksum {
            return Err(LumenError::validation(
                Some(wu_id),
                "spawn prompt checksum mismatch",
            ));
        }

        Ok(Self { wu_id, content })
    }
}
