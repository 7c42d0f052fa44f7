use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::request::Request;
use crate::revision::{EnrichmentState, Revision, RevisionId, sort_revisions};
use crate::scm::{DetailsResult, ListResult, ScmProxy};

pub const DEFAULT_POOL_SIZE: usize = 3;
pub const DEFAULT_MAX_ENRICHMENT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Empty,
    FetchingList,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub pool_size: usize,
    // 0 retries forever.
    pub max_enrichment_attempts: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            max_enrichment_attempts: DEFAULT_MAX_ENRICHMENT_ATTEMPTS,
        }
    }
}

struct DetailsSlot {
    id: RevisionId,
    request: Request<DetailsResult>,
}

/// Only the owning thread mutates a session; workers hand results back
/// through the requests [`Session::update`] polls.
pub struct Session {
    scm: ScmProxy,
    settings: SessionSettings,
    file_path: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    revisions: Vec<Revision>,
    cursor: Option<usize>,
    list_request: Option<Request<ListResult>>,
    details: Vec<DetailsSlot>,
    last_error: Option<String>,
}

impl Session {
    pub fn new(scm: ScmProxy, settings: SessionSettings) -> Self {
        Self {
            scm,
            settings: SessionSettings {
                pool_size: settings.pool_size.max(1),
                ..settings
            },
            file_path: None,
            working_dir: None,
            revisions: Vec::new(),
            cursor: None,
            list_request: None,
            details: Vec::new(),
            last_error: None,
        }
    }

    pub fn setup(&mut self, path: Option<&Path>) {
        self.cancel_requests();
        self.revisions.clear();
        self.cursor = None;
        self.last_error = None;
        self.file_path = None;
        self.working_dir = None;

        let Some(path) = path else {
            return;
        };

        let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let working_dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        self.file_path = Some(path);
        self.working_dir = Some(working_dir);

        self.issue_list_request();
    }

    pub fn refresh(&mut self) {
        if self.file_path.is_none() {
            return;
        }
        self.cancel_requests();
        for revision in &mut self.revisions {
            if !revision.is_enriched() {
                revision.enrichment = EnrichmentState::Pending;
            }
        }
        self.last_error = None;
        self.issue_list_request();
    }

    pub fn update(&mut self) {
        self.poll_list_request();
        if self.list_request.is_some() {
            return;
        }
        self.poll_details();
        self.schedule_details();
    }

    pub fn shutdown(&mut self) {
        self.cancel_requests();
        self.revisions.clear();
        self.cursor = None;
        self.file_path = None;
        self.working_dir = None;
    }

    pub fn state(&self) -> SessionState {
        if self.list_request.is_some() {
            SessionState::FetchingList
        } else if self.revisions.is_empty() {
            SessionState::Empty
        } else {
            SessionState::Ready
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn is_valid(&self) -> bool {
        self.file_path.as_deref().is_some_and(Path::is_file)
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    pub fn revisions(&self) -> &[Revision] {
        &self.revisions
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn current_revision(&self) -> Option<&Revision> {
        self.cursor.and_then(|index| self.revisions.get(index))
    }

    pub fn find_revision(&self, id: RevisionId) -> Option<&Revision> {
        self.revisions.iter().find(|revision| revision.id == id)
    }

    pub fn rev_node(&self) -> Option<&str> {
        self.current_revision().map(|revision| revision.node.as_str())
    }

    pub fn is_fetching_revisions(&self) -> bool {
        self.list_request.is_some()
    }

    pub fn has_revisions(&self) -> bool {
        !self.revisions.is_empty()
    }

    pub fn is_fetching_details(&self) -> bool {
        !self.details.is_empty()
    }

    pub fn in_flight_details(&self) -> usize {
        self.details.len()
    }

    /// `(enriched, total)`.
    pub fn enrichment_progress(&self) -> (usize, usize) {
        let enriched = self
            .revisions
            .iter()
            .filter(|revision| revision.is_enriched())
            .count();
        (enriched, self.revisions.len())
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn set_cursor(&mut self, index: isize) {
        self.cursor = match self.revisions.len() {
            0 => None,
            len => Some(index.clamp(0, len as isize - 1) as usize),
        };
    }

    pub fn next(&mut self) {
        if let Some(index) = self.cursor {
            self.set_cursor(index as isize + 1);
        }
    }

    pub fn previous(&mut self) {
        if let Some(index) = self.cursor {
            self.set_cursor(index as isize - 1);
        }
    }

    pub fn first(&mut self) {
        self.set_cursor(0);
    }

    pub fn last(&mut self) {
        self.set_cursor(isize::MAX);
    }

    pub fn set_current_revision(&mut self, id: RevisionId) -> bool {
        match self.position_of(id) {
            Some(index) => {
                self.cursor = Some(index);
                true
            }
            None => false,
        }
    }

    fn position_of(&self, id: RevisionId) -> Option<usize> {
        self.revisions.iter().position(|revision| revision.id == id)
    }

    fn issue_list_request(&mut self) {
        let (Some(file), Some(working_dir)) = (&self.file_path, &self.working_dir) else {
            return;
        };
        if !file.is_file() {
            debug!(file = %file.display(), "not an existing file; nothing to fetch");
            self.revisions.clear();
            self.cursor = None;
            return;
        }

        match self.scm.fetch_revisions(file, working_dir) {
            Ok(request) => {
                debug!(file = %file.display(), "fetching revision list");
                self.list_request = Some(request);
            }
            Err(err) => {
                warn!(error = %err, "failed to start revision list request");
                self.last_error = Some(format!("could not start request: {err}"));
            }
        }
    }

    fn poll_list_request(&mut self) {
        let Some(request) = self.list_request.as_mut() else {
            return;
        };
        if !request.is_done() {
            return;
        }
        let Some(request) = self.list_request.take() else {
            return;
        };

        match request.take() {
            Some(Ok(revisions)) => self.install_revisions(revisions),
            Some(Err(failure)) => {
                warn!(error = %failure, "revision list fetch failed");
                self.last_error = Some(failure.to_string());
                self.revisions.clear();
                self.cursor = None;
            }
            None => {
                warn!("revision list worker exited without a result");
                self.last_error = Some("revision list worker exited without a result".to_string());
                self.revisions.clear();
                self.cursor = None;
            }
        }
    }

    fn install_revisions(&mut self, mut revisions: Vec<Revision>) {
        let previous = std::mem::take(&mut self.revisions);
        let current_id = self
            .cursor
            .and_then(|index| previous.get(index))
            .map(|revision| revision.id);

        for revision in &mut revisions {
            if let Some(old) = previous.iter().find(|old| old.id == revision.id)
                && old.is_enriched()
            {
                revision.carry_enrichment_from(old);
            }
        }
        sort_revisions(&mut revisions);
        self.revisions = revisions;

        self.cursor = match current_id.and_then(|id| self.position_of(id)) {
            Some(index) => Some(index),
            None => self.revisions.len().checked_sub(1),
        };

        info!(
            count = self.revisions.len(),
            file = %self.file_path.as_deref().unwrap_or(Path::new("")).display(),
            "revision list loaded"
        );
    }

    fn poll_details(&mut self) {
        let mut merged = false;
        let mut index = 0;
        while index < self.details.len() {
            if self.details[index].request.is_done() {
                let slot = self.details.swap_remove(index);
                merged |= self.finish_details(slot);
            } else {
                index += 1;
            }
        }
        if merged {
            self.resort();
        }
    }

    fn finish_details(&mut self, slot: DetailsSlot) -> bool {
        let DetailsSlot { id, request } = slot;
        let outcome = request.take();
        let Some(revision) = self.revisions.iter_mut().find(|revision| revision.id == id) else {
            debug!(revision = id, "dropping details for a revision no longer listed");
            return false;
        };

        match outcome {
            Some(Ok(details)) => {
                debug!(revision = id, lines = details.annotations.len(), "revision enriched");
                revision.apply_details(details);
                true
            }
            Some(Err(failure)) => {
                if !revision.is_enriched() {
                    let attempts = revision.failed_attempts() + 1;
                    warn!(revision = id, attempts, error = %failure, "revision enrichment failed");
                    revision.enrichment = EnrichmentState::Failed { attempts };
                }
                false
            }
            None => {
                if !revision.is_enriched() {
                    let attempts = revision.failed_attempts() + 1;
                    warn!(revision = id, attempts, "enrichment worker exited without a result");
                    revision.enrichment = EnrichmentState::Failed { attempts };
                }
                false
            }
        }
    }

    fn schedule_details(&mut self) {
        while self.details.len() < self.settings.pool_size {
            let Some(id) = self.next_candidate() else {
                break;
            };
            if !self.issue_details(id) {
                break;
            }
        }
    }

    // Cursor revision while pending, else newest pending, else newest retryable failure.
    fn next_candidate(&self) -> Option<RevisionId> {
        if let Some(current) = self.current_revision()
            && current.enrichment == EnrichmentState::Pending
        {
            return Some(current.id);
        }

        if let Some(pending) = self
            .revisions
            .iter()
            .rev()
            .find(|revision| revision.enrichment == EnrichmentState::Pending)
        {
            return Some(pending.id);
        }

        let max_attempts = self.settings.max_enrichment_attempts;
        self.revisions
            .iter()
            .rev()
            .find(|revision| match revision.enrichment {
                EnrichmentState::Failed { attempts } => max_attempts == 0 || attempts < max_attempts,
                _ => false,
            })
            .map(|revision| revision.id)
    }

    fn issue_details(&mut self, id: RevisionId) -> bool {
        let (Some(file), Some(working_dir)) = (&self.file_path, &self.working_dir) else {
            return false;
        };

        let request = match self.scm.fetch_revision_details(file, working_dir, id) {
            Ok(request) => request,
            Err(err) => {
                warn!(revision = id, error = %err, "failed to start enrichment request");
                self.last_error = Some(format!("could not start request: {err}"));
                return false;
            }
        };

        if let Some(revision) = self.revisions.iter_mut().find(|revision| revision.id == id)
            && !revision.is_enriched()
        {
            let attempts = revision.failed_attempts();
            if attempts > 0 {
                debug!(revision = id, attempts, "retrying enrichment");
            }
            revision.enrichment = EnrichmentState::InFlight { attempts };
        }
        self.details.push(DetailsSlot { id, request });
        true
    }

    fn resort(&mut self) {
        let current_id = self.current_revision().map(|revision| revision.id);
        sort_revisions(&mut self.revisions);
        if let Some(index) = current_id.and_then(|id| self.position_of(id)) {
            self.cursor = Some(index);
        }
    }

    fn cancel_requests(&mut self) {
        if let Some(request) = &self.list_request {
            request.cancel();
        }
        for slot in &self.details {
            slot.request.cancel();
        }

        if let Some(request) = self.list_request.take() {
            request.dispose();
        }
        for slot in std::mem::take(&mut self.details) {
            debug!(revision = slot.id, "cancelling enrichment request");
            slot.request.dispose();
        }

        for revision in &mut self.revisions {
            if let EnrichmentState::InFlight { attempts } = revision.enrichment {
                revision.enrichment = if attempts == 0 {
                    EnrichmentState::Pending
                } else {
                    EnrichmentState::Failed { attempts }
                };
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
