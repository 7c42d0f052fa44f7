use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate};

pub type RevisionId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnrichmentState {
    #[default]
    Pending,
    // Earlier failures, carried into the next `Failed`.
    InFlight {
        attempts: u32,
    },
    Failed {
        attempts: u32,
    },
    Done,
}

/// One line of `hg annotate` output: `<author> <revision> <date>: <code>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedLine {
    pub author: String,
    pub revision: String,
    pub date: String,
    pub code: String,
}

impl fmt::Display for AnnotatedLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}: {}",
            self.author, self.revision, self.date, self.code
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeBase {
    pub date: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionDetails {
    pub id: RevisionId,
    pub annotations: Vec<AnnotatedLine>,
    pub merge_base: Option<MergeBase>,
    pub patch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub id: RevisionId,
    pub node: String,
    pub author: String,
    pub age: String,
    pub committed_date: String,
    pub committed_at: Option<DateTime<FixedOffset>>,
    pub branch: String,
    pub description: String,
    pub merged_date: Option<String>,
    pub merged_at: Option<DateTime<FixedOffset>>,
    pub base_summary: Option<String>,
    pub patch: Option<String>,
    pub annotations: Vec<AnnotatedLine>,
    pub enrichment: EnrichmentState,
}

impl Revision {
    pub fn is_enriched(&self) -> bool {
        self.enrichment == EnrichmentState::Done
    }

    pub fn effective_date(&self) -> Option<DateTime<FixedOffset>> {
        self.merged_at.or(self.committed_at)
    }

    pub fn display_date(&self) -> &str {
        self.merged_date.as_deref().unwrap_or(&self.committed_date)
    }

    pub fn failed_attempts(&self) -> u32 {
        match self.enrichment {
            EnrichmentState::Failed { attempts } | EnrichmentState::InFlight { attempts } => {
                attempts
            }
            _ => 0,
        }
    }

    pub fn apply_details(&mut self, details: RevisionDetails) {
        self.annotations = details.annotations;
        match details.merge_base {
            Some(base) => {
                self.merged_at = parse_scm_date(&base.date);
                self.merged_date = Some(base.date);
                self.base_summary = Some(base.summary);
            }
            None => {
                self.merged_at = None;
                self.merged_date = None;
                self.base_summary = None;
            }
        }
        self.patch = Some(details.patch);
        self.enrichment = EnrichmentState::Done;
    }

    pub fn carry_enrichment_from(&mut self, previous: &Revision) {
        self.annotations = previous.annotations.clone();
        self.merged_date = previous.merged_date.clone();
        self.merged_at = previous.merged_at;
        self.base_summary = previous.base_summary.clone();
        self.patch = previous.patch.clone();
        self.enrichment = previous.enrichment;
    }

    pub fn introduced(&self, line: &AnnotatedLine) -> bool {
        !self.node.is_empty() && line.revision == self.node
    }
}

pub fn sort_revisions(revisions: &mut [Revision]) {
    revisions.sort_by_key(|revision| (revision.effective_date(), revision.id));
}

/// Parses the date formats hg templates emit (`isodate`, `isodatesec`,
/// `rfc3339date`, `shortdate`).
pub fn parse_scm_date(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    for format in ["%Y-%m-%d %H:%M %z", "%Y-%m-%d %H:%M:%S %z"] {
        if let Ok(parsed) = DateTime::parse_from_str(raw, format) {
            return Some(parsed);
        }
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed);
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().fixed_offset())
}

#[cfg(test)]
pub(crate) fn sample_revision(id: RevisionId, committed_date: &str) -> Revision {
    Revision {
        id,
        node: format!("{id:012x}"),
        author: "al".to_string(),
        age: "1 day ago".to_string(),
        committed_date: committed_date.to_string(),
        committed_at: parse_scm_date(committed_date),
        branch: "default".to_string(),
        description: format!("change {id}"),
        merged_date: None,
        merged_at: None,
        base_summary: None,
        patch: None,
        annotations: Vec::new(),
        enrichment: EnrichmentState::Pending,
    }
}
