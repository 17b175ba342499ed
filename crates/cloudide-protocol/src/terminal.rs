use serde::{Deserialize, Serialize};

use crate::{InboundEnvelope, tags};

/// Upper bound on the `data` carried by a single stdin control frame.
pub const MAX_CONTROL_FRAME_BYTES: usize = 8 * 1024;

/// Client-to-backend control frames on a terminal connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TerminalControl {
    Stdin { data: String },
    Resize { cols: u16, rows: u16 },
}

impl TerminalControl {
    /// Split keystroke data into stdin frames no larger than
    /// [`MAX_CONTROL_FRAME_BYTES`], never cutting a UTF-8 sequence.
    pub fn stdin_frames(data: &str) -> Vec<TerminalControl> {
        let mut frames = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let mut cut = rest.len().min(MAX_CONTROL_FRAME_BYTES);
            while !rest.is_char_boundary(cut) {
                cut -= 1;
            }
            let (head, tail) = rest.split_at(cut);
            frames.push(TerminalControl::Stdin {
                data: head.to_string(),
            });
            rest = tail;
        }
        frames
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Tagged backend-to-client frames.
#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum TaggedOutput {
    Output {
        data: String,
    },
    Exit {
        #[serde(default)]
        code: Option<i32>,
    },
    Error {
        message: String,
    },
}

/// Everything a terminal connection can deliver, after decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutput {
    /// Bytes to write verbatim to the terminal surface.
    Output(Vec<u8>),
    /// The remote process exited.
    Exit { code: Option<i32> },
    /// The backend reported a terminal-level error.
    Error { message: String },
}

/// One websocket payload as delivered by the transport.
#[derive(Debug, Clone, Copy)]
pub enum RawFrame<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

/// Decode any inbound terminal payload into a [`TerminalOutput`].
///
/// Accepted shapes, in order: tagged `{"op": ...}` frames, the legacy
/// `terminal:output` workspace envelope, and anything else as raw output.
/// Binary payloads that are valid UTF-8 go through the same text path;
/// other binary payloads are raw output bytes.
pub fn decode_terminal_frame(frame: RawFrame<'_>) -> TerminalOutput {
    match frame {
        RawFrame::Text(text) => decode_text(text),
        RawFrame::Binary(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => decode_text(text),
            Err(_) => TerminalOutput::Output(bytes.to_vec()),
        },
    }
}

fn decode_text(text: &str) -> TerminalOutput {
    if text.trim_start().starts_with('{') {
        if let Ok(tagged) = serde_json::from_str::<TaggedOutput>(text) {
            return match tagged {
                TaggedOutput::Output { data } => TerminalOutput::Output(data.into_bytes()),
                TaggedOutput::Exit { code } => TerminalOutput::Exit { code },
                TaggedOutput::Error { message } => TerminalOutput::Error { message },
            };
        }
        if let Ok(envelope) = serde_json::from_str::<InboundEnvelope>(text) {
            if envelope.message == tags::TERMINAL_OUTPUT {
                if let Some(data) = envelope.payload.as_str() {
                    return TerminalOutput::Output(data.as_bytes().to_vec());
                }
            }
        }
    }
    TerminalOutput::Output(text.as_bytes().to_vec())
}
