//! Tube list and editor synchronization
//!
//! Individual `TUBE` lines update the live list directly unless a snapshot is
//! being collected, in which case they go to a scratch list that replaces the
//! live one atomically on the terminator. The editor keeps its own draft that
//! inbound reports never overwrite while it is dirty.

use crate::engine::SyncEngine;
use crate::reconcile::PendingIntent;
use crate::timers::TimerPurpose;
use preamp_core::{ms, parse_tubes_text, Command, EditorError, TubeRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::debug;

/// Editor fields as typed by the user, not yet validated
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TubeDraft {
    pub num: i64,
    pub active: bool,
    pub hours: i64,
    pub minutes: i64,
}

impl Default for TubeDraft {
    fn default() -> Self {
        Self {
            num: 1,
            active: true,
            hours: 0,
            minutes: 0,
        }
    }
}

impl TubeDraft {
    pub fn from_record(record: &TubeRecord) -> Self {
        Self {
            num: i64::from(record.num),
            active: record.active,
            hours: i64::from(record.age_hours),
            minutes: i64::from(record.age_minutes),
        }
    }

    pub fn tube_number(&self) -> Result<u32, EditorError> {
        match u32::try_from(self.num) {
            Ok(num) if num >= 1 => Ok(num),
            _ => Err(EditorError::InvalidTubeNumber),
        }
    }

    pub fn validate(&self) -> Result<TubeRecord, EditorError> {
        let num = self.tube_number()?;
        let age_hours = u32::try_from(self.hours).map_err(|_| EditorError::InvalidHours)?;
        let age_minutes = match u32::try_from(self.minutes) {
            Ok(minutes) if minutes <= 59 => minutes,
            _ => return Err(EditorError::InvalidMinutes),
        };
        Ok(TubeRecord {
            num,
            active: self.active,
            age_hours,
            age_minutes,
        })
    }
}

/// Result of pressing delete in the editor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// First press; a second press for the same tube before `until` deletes it
    Armed { num: u32, until: Instant },
    Sent(u32),
}

#[derive(Debug, Default)]
pub struct TubeSync {
    pub(crate) draft: TubeDraft,
    pub(crate) dirty: bool,
    pub(crate) selected: Option<u32>,
    pub(crate) delete_confirm: Option<PendingIntent<u32>>,
    pub(crate) snapshot_pending: bool,
    pub(crate) scratch: BTreeMap<u32, TubeRecord>,
    pub(crate) manual_refresh_pending: bool,
}

impl TubeSync {
    pub fn draft(&self) -> &TubeDraft {
        &self.draft
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn selected(&self) -> Option<u32> {
        self.selected
    }

    pub fn delete_armed(&self) -> Option<u32> {
        self.delete_confirm.as_ref().map(|confirm| confirm.target)
    }

    pub fn snapshot_pending(&self) -> bool {
        self.snapshot_pending
    }

    fn load(&mut self, record: &TubeRecord) {
        self.selected = Some(record.num);
        self.draft = TubeDraft::from_record(record);
    }
}

impl SyncEngine {
    pub fn tubes(&self) -> &TubeSync {
        &self.tubes
    }

    /// Start collecting a bulk snapshot and ask the bridge for it
    pub fn request_tubes_snapshot(&mut self) {
        self.tubes.snapshot_pending = true;
        self.tubes.scratch.clear();
        self.send_command(Command::GetTubes);
    }

    pub(crate) fn on_tube_record(&mut self, record: TubeRecord, now: Instant) {
        if !self.filter_tube_report(&record, now) {
            return;
        }
        if self.tubes.snapshot_pending {
            self.tubes.scratch.insert(record.num, record);
            return;
        }

        self.store.upsert_tube(record);
        self.reconcile_tubes();
        let editor = &mut self.tubes;
        if !editor.dirty && editor.selected.map_or(true, |num| num == record.num) {
            editor.load(&record);
        }
    }

    pub(crate) fn on_tubes_end(&mut self, now: Instant) {
        if self.tubes.snapshot_pending {
            let tubes = std::mem::take(&mut self.tubes.scratch);
            self.apply_tube_snapshot(tubes, now);
        } else {
            self.complete_manual_refresh(now);
        }
    }

    /// Apply a plain-text tube list (the HTTP `/api/tubes` body) as one snapshot
    pub(crate) fn on_tubes_text(&mut self, text: &str, now: Instant) {
        let mut tubes = BTreeMap::new();
        for record in parse_tubes_text(text) {
            if self.filter_tube_report(&record, now) {
                tubes.insert(record.num, record);
            } else if let Some(current) = self.store.tube(record.num) {
                tubes.insert(current.num, *current);
            }
        }
        self.apply_tube_snapshot(tubes, now);
    }

    fn apply_tube_snapshot(&mut self, tubes: BTreeMap<u32, TubeRecord>, now: Instant) {
        debug!("Applying tube snapshot with {} record(s)", tubes.len());
        self.tubes.snapshot_pending = false;
        self.store.replace_tubes(tubes);
        self.reconcile_tubes();

        if let Some(num) = self.tubes.delete_armed() {
            if !self.store.has_tube(num) {
                self.disarm_delete();
            }
        }

        let selected = self.tubes.selected;
        match selected.and_then(|num| self.store.tube(num)).copied() {
            Some(record) => {
                if !self.tubes.dirty {
                    self.tubes.load(&record);
                }
            }
            None if self.tubes.dirty => {}
            None => {
                self.tubes.selected = None;
                if let Some(lowest) = self.store.lowest_tube().copied() {
                    self.tubes.load(&lowest);
                }
            }
        }

        self.complete_manual_refresh(now);
    }

    fn complete_manual_refresh(&mut self, now: Instant) {
        if !self.tubes.manual_refresh_pending {
            return;
        }
        self.tubes.manual_refresh_pending = false;
        self.timers.cancel(TimerPurpose::ManualTubeRefresh);
        let clear_after = self.config.notice_clear_ms;
        self.set_notice("Tube list refreshed.".to_string(), Some(clear_after), now);
    }

    pub(crate) fn on_manual_refresh_timeout(&mut self, now: Instant) {
        if !self.tubes.manual_refresh_pending {
            return;
        }
        self.tubes.manual_refresh_pending = false;
        self.set_notice("Tube refresh timed out.".to_string(), None, now);
    }

    /// Row click: load an existing record into the editor. Returns `false` for unknown tubes.
    pub fn select_tube(&mut self, num: u32, now: Instant) -> bool {
        let Some(record) = self.store.tube(num).copied() else {
            return false;
        };
        self.tubes.load(&record);
        self.tubes.dirty = false;
        self.disarm_delete();
        let clear_after = self.config.notice_clear_ms;
        self.set_notice(format!("Editing tube {}", num), Some(clear_after), now);
        true
    }

    /// Replace the draft with user edits. Changing the number re-selects that tube.
    pub fn edit_tube(&mut self, draft: TubeDraft) {
        if draft.num != self.tubes.draft.num {
            if let Ok(num) = draft.tube_number() {
                self.tubes.selected = Some(num);
            }
            self.disarm_delete();
        }
        self.tubes.draft = draft;
        self.tubes.dirty = true;
    }

    /// Ask the bridge for the draft's tube; its report will replace the draft
    pub fn load_tube(&mut self, now: Instant) -> Result<(), EditorError> {
        let num = self.editor_result(self.tubes.draft.tube_number(), now)?;
        self.tubes.selected = Some(num);
        self.tubes.dirty = false;
        self.send_command(Command::GetTube(num));
        self.set_notice(format!("Loading tube {}...", num), None, now);
        Ok(())
    }

    pub fn save_tube(&mut self, now: Instant) -> Result<TubeRecord, EditorError> {
        let record = self.editor_result(self.tubes.draft.validate(), now)?;
        self.tubes.selected = Some(record.num);
        self.begin_tube_save(record, now);
        self.set_notice(format!("Saving tube {}...", record.num), None, now);
        Ok(record)
    }

    pub fn add_tube(&mut self, now: Instant) -> Result<TubeRecord, EditorError> {
        let record = self.editor_result(self.tubes.draft.validate(), now)?;
        self.begin_tube_add(record, now);
        self.set_notice("Adding tube...".to_string(), None, now);
        Ok(record)
    }

    /// Two-step delete: the first press arms a confirmation window, a second
    /// press for the same tube inside it sends `DEL TUBE`
    pub fn delete_tube(&mut self, now: Instant) -> Result<DeleteOutcome, EditorError> {
        let num = self.editor_result(self.tubes.draft.tube_number(), now)?;

        let confirmed = self
            .tubes
            .delete_confirm
            .as_ref()
            .is_some_and(|confirm| confirm.target == num && !confirm.is_expired(now));
        if confirmed {
            self.disarm_delete();
            self.begin_tube_delete(num, now);
            self.set_notice(format!("Deleting tube {}...", num), None, now);
            return Ok(DeleteOutcome::Sent(num));
        }

        let window = ms(self.config.delete_confirm_window_ms);
        let confirm = PendingIntent::new(num, now, window);
        let until = confirm.deadline;
        self.tubes.delete_confirm = Some(confirm);
        self.timers.arm(TimerPurpose::DeleteConfirmExpiry, until);
        self.set_notice(
            format!(
                "Click Confirm Delete again within {}s to delete tube {}.",
                window.as_secs(),
                num
            ),
            None,
            now,
        );
        Ok(DeleteOutcome::Armed { num, until })
    }

    pub(crate) fn disarm_delete(&mut self) {
        self.tubes.delete_confirm = None;
        self.timers.cancel(TimerPurpose::DeleteConfirmExpiry);
    }

    /// Manual refresh: discard local edits and re-read the whole list
    pub fn refresh_tubes(&mut self, now: Instant) {
        self.tubes.dirty = false;
        self.tubes.manual_refresh_pending = true;
        self.timers.arm(
            TimerPurpose::ManualTubeRefresh,
            now + ms(self.config.manual_refresh_timeout_ms),
        );
        self.request_tubes_snapshot();
    }

    pub(crate) fn on_done_save(&mut self, num: Option<u32>, now: Instant) {
        let clear_after = self.config.notice_clear_ms;
        match num {
            Some(num) => {
                if self.tubes.selected == Some(num) {
                    self.tubes.dirty = false;
                }
                self.acknowledge_tube_save(num, now);
                self.set_notice(format!("Tube {} save completed.", num), Some(clear_after), now);
            }
            None => self.set_notice("Tube save completed.".to_string(), Some(clear_after), now),
        }
        self.timers.arm(
            TimerPurpose::TubesSnapshot,
            now + ms(self.config.save_snapshot_delay_ms),
        );
    }

    /// Post validation failures as notices before handing them back
    fn editor_result<T>(
        &mut self,
        result: Result<T, EditorError>,
        now: Instant,
    ) -> Result<T, EditorError> {
        if let Err(e) = &result {
            self.set_notice(e.to_string(), None, now);
        }
        result
    }
}
