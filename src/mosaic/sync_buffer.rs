use std::sync::Mutex;

use ffmpeg_bus::picture::PictureRef;

struct State {
    slots: Vec<Option<PictureRef>>,
    /// Cursors only ever grow; `written - read` is the number of unread pictures.
    written: u64,
    read: u64,
    /// Timestamp of the last picture handed out, unset until the first pull or
    /// after a reset or stall.
    last_ts: Option<i64>,
    last: Option<PictureRef>,
    repeats: u32,
    /// Timestamp served just before a stall. Pictures at or below it are never
    /// served again, even though the watermark is gone.
    floor: Option<i64>,
}

impl State {
    fn slot(&self, cursor: u64) -> Option<&PictureRef> {
        let index = (cursor % self.slots.len() as u64) as usize;
        self.slots[index].as_ref()
    }
}

/// Bounded buffer between one capture source and the compositor.
///
/// The source pushes at its own cadence; the compositor pulls once per output
/// tick and gets the picture due for that tick. Backlog beyond the capacity is
/// dropped rather than blocking the source.
pub struct SyncBuffer {
    name: String,
    repeat_limit: u32,
    state: Mutex<State>,
}

impl SyncBuffer {
    pub fn new(name: impl Into<String>, capacity: usize, repeat_limit: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            repeat_limit,
            state: Mutex::new(State {
                slots: vec![None; capacity],
                written: 0,
                read: 0,
                last_ts: None,
                last: None,
                repeats: 0,
                floor: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // a panic while holding the lock leaves the cursors consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    /// Number of pushed pictures not yet consumed by `pull`.
    pub fn occupancy(&self) -> usize {
        let state = self.lock();
        (state.written - state.read) as usize
    }

    pub fn push(&self, picture: PictureRef) {
        let mut state = self.lock();
        let capacity = state.slots.len() as u64;
        if state.written - state.read >= capacity {
            log::warn!(
                target: "sync",
                "{}: buffer overflow, dropping {} unread pictures",
                self.name,
                state.written - state.read
            );
            state.read = state.written;
        }
        let index = (state.written % capacity) as usize;
        state.slots[index] = Some(picture);
        state.written += 1;
    }

    /// Picture due for a tick `span` microseconds after the previous one.
    ///
    /// Unread pictures older than `last served + span` are skipped as long as a
    /// newer one exists. When nothing newer than the last served picture is
    /// available it is served again, up to the repeat limit; past that the source
    /// is considered stalled and `None` is returned until fresh pictures arrive.
    pub fn pull(&self, span: i64) -> Option<PictureRef> {
        let mut state = self.lock();

        if state.read < state.written {
            let mut cursor = state.read;
            match state.last_ts {
                // no watermark: serve the newest picture
                None => cursor = state.written - 1,
                Some(last_ts) => {
                    let due = last_ts.saturating_add(span);
                    while cursor + 1 < state.written
                        && state.slot(cursor).is_some_and(|p| p.pts() < due)
                    {
                        cursor += 1;
                    }
                }
            }
            state.read = cursor + 1;

            if let Some(candidate) = state.slot(cursor).cloned() {
                let watermark = state.last_ts.or(state.floor);
                if watermark.is_none_or(|w| candidate.pts() > w) {
                    state.last_ts = Some(candidate.pts());
                    state.last = Some(candidate.clone());
                    state.repeats = 0;
                    state.floor = None;
                    return Some(candidate);
                }
            }
        }

        self.repeat(&mut state)
    }

    fn repeat(&self, state: &mut State) -> Option<PictureRef> {
        let last = state.last.clone()?;
        state.repeats += 1;
        if state.repeats > self.repeat_limit {
            log::warn!(
                target: "sync",
                "{}: stalled, picture at {} repeated {} times",
                self.name,
                last.pts(),
                self.repeat_limit
            );
            state.floor = Some(last.pts());
            state.last = None;
            state.last_ts = None;
            state.repeats = 0;
            return None;
        }
        Some(last)
    }

    /// Drops everything buffered and forgets the last served timestamp. Called
    /// after the source reconnects, since its timestamps restart.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.slots.iter_mut().for_each(|slot| *slot = None);
        state.written = 0;
        state.read = 0;
        state.last_ts = None;
        state.last = None;
        state.repeats = 0;
        state.floor = None;
        log::debug!(target: "sync", "{}: reset", self.name);
    }
}

#[cfg(test)]
#[path = "sync_buffer_test.rs"]
mod sync_buffer_test;
