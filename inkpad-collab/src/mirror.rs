//! A participant's local copy of the shared text and drawing.
//!
//! The UI layer writes into the mirror (keystrokes, strokes, revision
//! requests) and reads from it to render. The sync engine drains local
//! changes from it and overwrites it with authoritative state. Inbound
//! notifications only flip the per-kind dirty flags.
//!
//! ```text
//!   UI ──edit_text/draw──► LocalMirror ◄──apply_remote_*── SyncEngine
//!                            ▲      │
//!   notify(kind) ──mark_dirty┘      └──take_local_*──► push to authority
//! ```

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

use crate::fanout::{DeliveryError, NotifySink};
use crate::protocol::{ChangeKind, Drawing, Segment};

#[derive(Debug, Default)]
struct TextBuffer {
    content: String,
    /// Caret as a char index into `content`.
    caret: usize,
    /// Set on every local keystroke, cleared once the edit is pushed.
    changed: bool,
}

#[derive(Debug, Default)]
struct Canvas {
    drawing: Drawing,
    changed: bool,
}

#[derive(Debug, Default)]
struct RevisionPanel {
    display: u64,
    typing: bool,
    requested: Option<u64>,
}

pub struct LocalMirror {
    text: Mutex<TextBuffer>,
    canvas: Mutex<Canvas>,
    revision: Mutex<RevisionPanel>,
    text_dirty: AtomicBool,
    drawing_dirty: AtomicBool,
    redraws: AtomicU64,
    text_wake: Notify,
}

impl LocalMirror {
    /// An empty mirror marked dirty for both kinds, so the first sync pulls
    /// the authoritative state.
    pub fn new() -> Self {
        Self {
            text: Mutex::new(TextBuffer::default()),
            canvas: Mutex::new(Canvas::default()),
            revision: Mutex::new(RevisionPanel::default()),
            text_dirty: AtomicBool::new(true),
            drawing_dirty: AtomicBool::new(true),
            redraws: AtomicU64::new(0),
            text_wake: Notify::new(),
        }
    }

    // ── UI side ───────────────────────────────────────────

    /// Replace the text with what the user typed; `caret` is a char index.
    pub fn edit_text(&self, content: impl Into<String>, caret: usize) {
        {
            let mut text = self.text.lock();
            text.content = content.into();
            text.caret = caret.min(text.content.chars().count());
            text.changed = true;
        }
        self.text_wake.notify_one();
    }

    pub fn text(&self) -> String {
        self.text.lock().content.clone()
    }

    pub fn caret(&self) -> usize {
        self.text.lock().caret
    }

    pub fn set_caret(&self, caret: usize) {
        let mut text = self.text.lock();
        text.caret = caret.min(text.content.chars().count());
    }

    /// Append a stroke drawn by the user.
    pub fn draw(&self, segment: Segment) {
        let mut canvas = self.canvas.lock();
        canvas.drawing.push(segment);
        canvas.changed = true;
    }

    /// Replace the whole local drawing (e.g. "clear canvas").
    pub fn replace_drawing(&self, drawing: Drawing) {
        let mut canvas = self.canvas.lock();
        canvas.drawing = drawing;
        canvas.changed = true;
    }

    pub fn drawing(&self) -> Drawing {
        self.canvas.lock().drawing.clone()
    }

    /// Number of full canvas redraws caused by remote refreshes.
    pub fn redraw_count(&self) -> u64 {
        self.redraws.load(Ordering::Relaxed)
    }

    /// Revision number shown in the revision control.
    pub fn revision_display(&self) -> u64 {
        self.revision.lock().display
    }

    /// Called on every keystroke in the revision control.
    pub fn set_revision_typing(&self, typing: bool) {
        self.revision.lock().typing = typing;
    }

    pub fn is_revision_typing(&self) -> bool {
        self.revision.lock().typing
    }

    /// Ask for `revision` to be restored. Submitting ends the typing state.
    pub fn request_rollback(&self, revision: u64) {
        {
            let mut panel = self.revision.lock();
            panel.requested = Some(revision);
            panel.typing = false;
        }
        self.text_wake.notify_one();
    }

    // ── Notification side ─────────────────────────────────

    /// Mark `kind` stale. Safe to call from any task at any time.
    pub fn mark_dirty(&self, kind: ChangeKind) {
        match kind {
            ChangeKind::Text => {
                self.text_dirty.store(true, Ordering::Release);
                self.text_wake.notify_one();
            }
            ChangeKind::Drawing => self.drawing_dirty.store(true, Ordering::Release),
        }
    }

    pub fn is_dirty(&self, kind: ChangeKind) -> bool {
        self.flag(kind).load(Ordering::Acquire)
    }

    // ── Engine side ───────────────────────────────────────

    /// Clear the dirty flag of `kind`, returning whether it was set.
    pub fn take_dirty(&self, kind: ChangeKind) -> bool {
        self.flag(kind).swap(false, Ordering::AcqRel)
    }

    /// If the user changed the text since the last push, clear the flag and
    /// return the text to push.
    pub fn take_local_text(&self) -> Option<String> {
        let mut text = self.text.lock();
        if !text.changed {
            return None;
        }
        text.changed = false;
        Some(text.content.clone())
    }

    pub fn take_local_drawing(&self) -> Option<Drawing> {
        let mut canvas = self.canvas.lock();
        if !canvas.changed {
            return None;
        }
        canvas.changed = false;
        Some(canvas.drawing.clone())
    }

    /// Put a taken local change back after its push failed.
    pub fn requeue_local(&self, kind: ChangeKind) {
        match kind {
            ChangeKind::Text => {
                self.text.lock().changed = true;
                self.text_wake.notify_one();
            }
            ChangeKind::Drawing => self.canvas.lock().changed = true,
        }
    }

    pub fn take_rollback_request(&self) -> Option<u64> {
        self.revision.lock().requested.take()
    }

    /// Overwrite the text with authoritative content, keeping the caret.
    ///
    /// Refused (returns `false`) while the user has unpushed edits.
    pub fn apply_remote_text(&self, content: String) -> bool {
        let mut text = self.text.lock();
        if text.changed {
            return false;
        }
        text.caret = text.caret.min(content.chars().count());
        text.content = content;
        true
    }

    /// Overwrite the text even if local edits are pending.
    pub fn force_remote_text(&self, content: String) {
        let mut text = self.text.lock();
        text.caret = text.caret.min(content.chars().count());
        text.content = content;
        text.changed = false;
    }

    /// Replace the drawing wholesale and redraw everything.
    ///
    /// Refused while local strokes are waiting to be pushed.
    pub fn apply_remote_drawing(&self, drawing: Drawing) -> bool {
        let mut canvas = self.canvas.lock();
        if canvas.changed {
            return false;
        }
        canvas.drawing = drawing;
        self.redraws.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Refresh the revision indicator unless the user is typing into it.
    pub fn show_revision(&self, revision: u64) -> bool {
        let mut panel = self.revision.lock();
        if panel.typing {
            return false;
        }
        panel.display = revision;
        true
    }

    /// Resolves when something relevant to the text loop happened.
    pub async fn text_activity(&self) {
        self.text_wake.notified().await
    }

    fn flag(&self, kind: ChangeKind) -> &AtomicBool {
        match kind {
            ChangeKind::Text => &self.text_dirty,
            ChangeKind::Drawing => &self.drawing_dirty,
        }
    }
}

impl Default for LocalMirror {
    fn default() -> Self {
        Self::new()
    }
}

/// In-process delivery: the authority notifies a mirror directly.
impl NotifySink for LocalMirror {
    fn notify(&self, kind: ChangeKind) -> BoxFuture<'_, Result<(), DeliveryError>> {
        self.mark_dirty(kind);
        Box::pin(async { Ok(()) })
    }
}
