//! Console collaborator for the keyward trust engine.

use async_trait::async_trait;
use keyward_license::{KeyPrompt, PromptNotice};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Shown before each key entry.
pub const KEY_PROMPT: &str = "Enter your license key (format: XXXX-XXXX-XXXX-XXXX): ";
/// Shown after a denied key.
pub const RETRY_PROMPT: &str = "Press Enter to retry, or type 'exit' to quit: ";
/// Answer to [`RETRY_PROMPT`] that abandons startup.
pub const EXIT_WORD: &str = "exit";

/// [`KeyPrompt`] over a line reader and a writer, normally stdin and stdout.
pub struct ConsolePrompt<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> ConsolePrompt<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Returns the writer, e.g. to inspect captured output.
    pub fn into_writer(self) -> W {
        self.writer
    }

    async fn write(&mut self, text: &str) {
        // Output is best effort.
        if let Err(e) = self.writer.write_all(text.as_bytes()).await {
            debug!(error = %e, "Console write failed");
            return;
        }
        let _ = self.writer.flush().await;
    }

    /// Reads one line without its terminator. `None` at end of input.
    async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line).await {
            Ok(0) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
            Err(e) => {
                debug!(error = %e, "Console read failed");
                None
            }
        }
    }
}

#[async_trait]
impl<R, W> KeyPrompt for ConsolePrompt<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn read_key(&mut self) -> Option<String> {
        self.write(KEY_PROMPT).await;
        self.read_line().await
    }

    async fn confirm_retry(&mut self) -> bool {
        self.write(RETRY_PROMPT).await;
        match self.read_line().await {
            Some(answer) => !answer.trim().eq_ignore_ascii_case(EXIT_WORD),
            None => false,
        }
    }

    async fn notify(&mut self, notice: &PromptNotice) {
        let marker = match notice {
            PromptNotice::Accepted { .. } => "[OK] ",
            PromptNotice::CachedKeyRejected(_)
            | PromptNotice::EmptyKey
            | PromptNotice::Rejected(_)
            | PromptNotice::SecurityViolation => "[X] ",
            PromptNotice::CachedKeyFound | PromptNotice::Validating => "",
        };
        self.write(&format!("{marker}{notice}\n")).await;
    }
}
