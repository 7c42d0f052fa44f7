use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::executor::{CommandLine, CommandOutput, CommandRunner};
use crate::request::{Request, StopSignal};
use crate::revision::{
    AnnotatedLine, EnrichmentState, MergeBase, Revision, RevisionDetails, RevisionId,
    parse_scm_date,
};

pub const FIELD_DELIMITER: char = '|';
pub const LIST_FIELD_COUNT: usize = 7;

const LIST_TEMPLATE: &str = "{rev}|{author|user}|{node|short}|{date|age}|{date|isodate}|{branch}|{desc|strip|firstline}\\n";
const MERGE_BASE_TEMPLATE: &str = "{date|isodate}|{desc|strip|firstline}";
const ANNOTATION_METADATA_TOKENS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("invalid revision id `{0}`")]
    InvalidId(String),
    #[error("missing `:` between annotation metadata and code")]
    MissingCodeSeparator,
    #[error("expected 3 annotation metadata tokens (author, revision, date), found {0}")]
    MetadataTokens(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchFailure {
    #[error("`{command}` could not be started")]
    Spawn { command: String },
    #[error("`{command}` exited with code {code}")]
    Tool { command: String, code: i32 },
    #[error("`{command}` was cancelled")]
    Cancelled { command: String },
}

pub type ListResult = Result<Vec<Revision>, FetchFailure>;
pub type DetailsResult = Result<RevisionDetails, FetchFailure>;

#[derive(Debug, Clone)]
pub struct ScmSettings {
    pub executable: String,
    pub mainline_branch: String,
    pub include_merges: bool,
    pub dispose_timeout: Duration,
}

impl Default for ScmSettings {
    fn default() -> Self {
        Self {
            executable: "hg".to_string(),
            mainline_branch: "default".to_string(),
            include_merges: false,
            dispose_timeout: crate::request::DEFAULT_DISPOSE_TIMEOUT,
        }
    }
}

pub fn list_revisions_command(settings: &ScmSettings, file: &Path) -> CommandLine {
    let mut command = CommandLine::new(&settings.executable)
        .arg("log")
        .arg("--template")
        .arg(LIST_TEMPLATE)
        .arg("-r")
        .arg("ancestors(branch(.))");
    if !settings.include_merges {
        command = command.arg("--no-merges");
    }
    command.arg(path_arg(file))
}

pub fn annotate_command(settings: &ScmSettings, file: &Path, id: RevisionId) -> CommandLine {
    CommandLine::new(&settings.executable)
        .args(["annotate", "--user", "--changeset", "--date", "--quiet"])
        .args(["-w", "-b", "-B"])
        .arg("-r")
        .arg(id.to_string())
        .arg(path_arg(file))
}

pub fn merge_base_command(settings: &ScmSettings, id: RevisionId) -> CommandLine {
    CommandLine::new(&settings.executable)
        .arg("log")
        .arg("-r")
        .arg(format!(
            "first(descendants({id}) and branch('{}'))",
            settings.mainline_branch
        ))
        .arg("--template")
        .arg(MERGE_BASE_TEMPLATE)
}

pub fn patch_command(settings: &ScmSettings, file: &Path, id: RevisionId) -> CommandLine {
    CommandLine::new(&settings.executable)
        .arg("diff")
        .arg("--change")
        .arg(id.to_string())
        .arg(path_arg(file))
}

fn path_arg(file: &Path) -> String {
    file.to_string_lossy().into_owned()
}

// `id|author|node|age|isodate|branch|description`; the description keeps any `|`.
pub fn parse_revision_line(line: &str) -> Result<Revision, ParseError> {
    let line = line.trim_end_matches('\r');
    let fields: Vec<&str> = line.splitn(LIST_FIELD_COUNT, FIELD_DELIMITER).collect();
    if fields.len() < LIST_FIELD_COUNT {
        return Err(ParseError::FieldCount {
            expected: LIST_FIELD_COUNT,
            found: fields.len(),
        });
    }

    let raw_id = fields[0].trim();
    let id = raw_id
        .parse::<RevisionId>()
        .map_err(|_| ParseError::InvalidId(raw_id.to_string()))?;
    let committed_date = fields[4].trim().to_string();

    Ok(Revision {
        id,
        author: fields[1].trim().to_string(),
        node: fields[2].trim().to_string(),
        age: fields[3].trim().to_string(),
        committed_at: parse_scm_date(&committed_date),
        committed_date,
        branch: fields[5].trim().to_string(),
        description: fields[6].trim().to_string(),
        merged_date: None,
        merged_at: None,
        base_summary: None,
        patch: None,
        annotations: Vec::new(),
        enrichment: EnrichmentState::Pending,
    })
}

pub fn parse_revision_list(text: &str) -> Vec<Revision> {
    let mut seen: HashSet<RevisionId> = HashSet::new();
    let mut revisions = Vec::new();

    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_revision_line(line) {
            Ok(revision) => {
                if seen.insert(revision.id) {
                    revisions.push(revision);
                } else {
                    warn!(line = index + 1, id = revision.id, "skipping duplicate revision record");
                }
            }
            Err(err) => {
                warn!(line = index + 1, error = %err, "skipping malformed revision record");
            }
        }
    }

    revisions
}

// Only the first `:` splits metadata from code.
pub fn parse_annotation_line(line: &str) -> Result<AnnotatedLine, ParseError> {
    let line = line.trim_end_matches('\r');
    let (metadata, code) = line
        .split_once(':')
        .ok_or(ParseError::MissingCodeSeparator)?;

    let tokens: Vec<&str> = metadata.split_whitespace().collect();
    if tokens.len() != ANNOTATION_METADATA_TOKENS {
        return Err(ParseError::MetadataTokens(tokens.len()));
    }

    Ok(AnnotatedLine {
        author: tokens[0].to_string(),
        revision: tokens[1].to_string(),
        date: tokens[2].to_string(),
        code: code.strip_prefix(' ').unwrap_or(code).to_string(),
    })
}

pub fn parse_annotations(text: &str) -> Vec<AnnotatedLine> {
    text.lines()
        .enumerate()
        .filter_map(|(index, line)| match parse_annotation_line(line) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(line = index + 1, error = %err, "skipping unexpected annotate line");
                None
            }
        })
        .collect()
}

// Empty output: not on the mainline yet.
pub fn parse_merge_base(text: &str) -> Result<Option<MergeBase>, ParseError> {
    let Some(line) = text.lines().map(str::trim).find(|line| !line.is_empty()) else {
        return Ok(None);
    };

    let Some((date, summary)) = line.split_once(FIELD_DELIMITER) else {
        return Err(ParseError::FieldCount {
            expected: 2,
            found: 1,
        });
    };

    Ok(Some(MergeBase {
        date: date.trim().to_string(),
        summary: summary.trim().to_string(),
    }))
}

fn check_output(command: &CommandLine, output: CommandOutput) -> Result<String, FetchFailure> {
    if output.cancelled {
        return Err(FetchFailure::Cancelled {
            command: command.to_string(),
        });
    }
    if output.is_spawn_failure() {
        return Err(FetchFailure::Spawn {
            command: command.to_string(),
        });
    }
    if !output.is_success() {
        return Err(FetchFailure::Tool {
            command: command.to_string(),
            code: output.exit_code,
        });
    }
    Ok(output.text)
}

#[derive(Clone)]
pub struct ScmProxy {
    runner: Arc<dyn CommandRunner>,
    settings: ScmSettings,
}

impl ScmProxy {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: ScmSettings) -> Self {
        Self { runner, settings }
    }

    pub fn settings(&self) -> &ScmSettings {
        &self.settings
    }

    pub fn fetch_revisions(
        &self,
        file: &Path,
        working_dir: &Path,
    ) -> io::Result<Request<ListResult>> {
        let runner = Arc::clone(&self.runner);
        let command = list_revisions_command(&self.settings, file);
        let working_dir = working_dir.to_path_buf();

        Request::issue("scm request", self.settings.dispose_timeout, move |stop| {
            let output = runner.run(&command, &working_dir, stop);
            let text = check_output(&command, output)?;
            let revisions = parse_revision_list(&text);
            debug!(count = revisions.len(), "parsed revision list");
            Ok(revisions)
        })
    }

    pub fn fetch_revision_details(
        &self,
        file: &Path,
        working_dir: &Path,
        id: RevisionId,
    ) -> io::Result<Request<DetailsResult>> {
        let runner = Arc::clone(&self.runner);
        let settings = self.settings.clone();
        let file = file.to_path_buf();
        let working_dir = working_dir.to_path_buf();

        Request::issue(
            format!("scm details {id}"),
            self.settings.dispose_timeout,
            move |stop| fetch_details(runner.as_ref(), &settings, &file, &working_dir, id, stop),
        )
    }
}

fn fetch_details(
    runner: &dyn CommandRunner,
    settings: &ScmSettings,
    file: &Path,
    working_dir: &Path,
    id: RevisionId,
    stop: &StopSignal,
) -> DetailsResult {
    let annotate = annotate_command(settings, file, id);
    let text = check_output(&annotate, runner.run(&annotate, working_dir, stop))?;
    let annotations = parse_annotations(&text);

    let merge_base_cmd = merge_base_command(settings, id);
    let text = check_output(&merge_base_cmd, runner.run(&merge_base_cmd, working_dir, stop))?;
    let merge_base = parse_merge_base(&text).unwrap_or_else(|err| {
        warn!(revision = id, error = %err, "ignoring unexpected merge base output");
        None
    });

    let patch_cmd = patch_command(settings, file, id);
    let patch = check_output(&patch_cmd, runner.run(&patch_cmd, working_dir, stop))?;

    Ok(RevisionDetails {
        id,
        annotations,
        merge_base,
        patch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::DEFAULT_DISPOSE_TIMEOUT;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Instant;

    const SCENARIO_A: &str = "1|al|ab12|3d|2024-01-01|default|fix bug\n2|bo|cd34|1d|2024-01-03|default|add feature\n";

    fn format_revision_line(revision: &Revision) -> String {
        [
            revision.id.to_string(),
            revision.author.clone(),
            revision.node.clone(),
            revision.age.clone(),
            revision.committed_date.clone(),
            revision.branch.clone(),
            revision.description.clone(),
        ]
        .join("|")
    }

    struct ScriptedRunner {
        calls: Mutex<Vec<String>>,
        fail_subcommand: Option<&'static str>,
    }

    impl ScriptedRunner {
        fn new(fail_subcommand: Option<&'static str>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_subcommand,
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, command: &CommandLine, _: &Path, _: &StopSignal) -> CommandOutput {
            let subcommand = command.args.first().cloned().unwrap_or_default();
            let is_merge_base = subcommand == "log"
                && command.args.iter().any(|arg| arg.starts_with("first("));
            let label = if is_merge_base { "mergebase".to_string() } else { subcommand };
            self.calls.lock().expect("calls lock").push(label.clone());

            if self.fail_subcommand == Some(label.as_str()) {
                return CommandOutput {
                    text: "abort: something broke".to_string(),
                    exit_code: 255,
                    cancelled: false,
                };
            }

            let text = match label.as_str() {
                "log" => SCENARIO_A.to_string(),
                "annotate" => "al ab12 2024-01-01: int x = 1;\nbo cd34 2024-01-03: x += 2;\n"
                    .to_string(),
                "mergebase" => "2024-01-05 09:00 +0000|Merge feature".to_string(),
                "diff" => "diff -r ab12 -r cd34 file.c\n+x += 2;\n".to_string(),
                _ => String::new(),
            };
            CommandOutput {
                text,
                exit_code: 0,
                cancelled: false,
            }
        }
    }

    fn wait_for<T>(mut request: Request<T>) -> Option<T> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !request.is_done() {
            assert!(Instant::now() < deadline, "request never completed");
            thread::sleep(Duration::from_millis(5));
        }
        request.take()
    }

    #[test]
    fn scenario_a_listing_parses_two_revisions() {
        let revisions = parse_revision_list(SCENARIO_A);
        assert_eq!(revisions.len(), 2);
        assert_eq!(revisions[0].id, 1);
        assert_eq!(revisions[0].author, "al");
        assert_eq!(revisions[0].node, "ab12");
        assert_eq!(revisions[0].age, "3d");
        assert_eq!(revisions[0].committed_date, "2024-01-01");
        assert_eq!(revisions[0].branch, "default");
        assert_eq!(revisions[0].description, "fix bug");
        assert_eq!(revisions[1].id, 2);
        assert_eq!(revisions[1].description, "add feature");
        assert!(revisions.iter().all(|r| r.enrichment == EnrichmentState::Pending));
    }

    #[test]
    fn scenario_b_annotation_line_splits_metadata_and_code() {
        let line = parse_annotation_line("al ab12 2024-01-01: int x = 1;").expect("annotation");
        assert_eq!(line.author, "al");
        assert_eq!(line.revision, "ab12");
        assert_eq!(line.date, "2024-01-01");
        assert_eq!(line.code, "int x = 1;");
    }

    #[test]
    fn annotation_code_keeps_colons_and_indentation() {
        let line = parse_annotation_line("  al ab12 2024-01-01:     url: \"http://x\"")
            .expect("annotation");
        assert_eq!(line.author, "al");
        assert_eq!(line.code, "    url: \"http://x\"");
    }

    #[test]
    fn annotation_lines_with_wrong_token_count_are_rejected() {
        assert_eq!(
            parse_annotation_line("al ab12: code"),
            Err(ParseError::MetadataTokens(2))
        );
        assert_eq!(
            parse_annotation_line("al ab12 2024-01-01 extra: code"),
            Err(ParseError::MetadataTokens(4))
        );
        assert_eq!(
            parse_annotation_line("no separator at all"),
            Err(ParseError::MissingCodeSeparator)
        );

        let parsed = parse_annotations("al ab12 2024-01-01: ok\nbroken line\nbo cd34 2024-01-02: also ok\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].code, "also ok");
    }

    #[test]
    fn malformed_line_is_dropped_and_others_kept() {
        let text = "1|al|ab12|3d|2024-01-01|default|fix bug\n\
                    2|bo|cd34\n\
                    3|cy|ef56|1h|2024-01-04|default|tidy\n";
        let revisions = parse_revision_list(text);
        let ids: Vec<RevisionId> = revisions.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn non_numeric_id_is_invalid() {
        assert_eq!(
            parse_revision_line("x|al|ab12|3d|2024-01-01|default|fix"),
            Err(ParseError::InvalidId("x".to_string()))
        );
    }

    #[test]
    fn description_may_contain_the_delimiter() {
        let revision =
            parse_revision_line("4|al|ab12|3d|2024-01-01|stable|a | b").expect("revision");
        assert_eq!(revision.description, "a | b");
        assert_eq!(revision.branch, "stable");
    }

    #[test]
    fn duplicate_ids_are_dropped() {
        let text = "1|al|ab12|3d|2024-01-01|default|first\n1|al|ab12|3d|2024-01-01|default|again\n";
        let revisions = parse_revision_list(text);
        assert_eq!(revisions.len(), 1);
        assert_eq!(revisions[0].description, "first");
    }

    #[test]
    fn merge_base_parsing() {
        assert_eq!(parse_merge_base(""), Ok(None));
        assert_eq!(parse_merge_base("\n"), Ok(None));
        assert_eq!(
            parse_merge_base("2024-01-05 09:00 +0000|Merge feature"),
            Ok(Some(MergeBase {
                date: "2024-01-05 09:00 +0000".to_string(),
                summary: "Merge feature".to_string(),
            }))
        );
        assert!(parse_merge_base("no delimiter").is_err());
    }

    #[test]
    fn list_command_excludes_merges_unless_requested() {
        let mut settings = ScmSettings::default();
        let command = list_revisions_command(&settings, Path::new("src/main.c"));
        assert_eq!(command.program, "hg");
        assert_eq!(command.args[0], "log");
        assert!(command.args.contains(&"ancestors(branch(.))".to_string()));
        assert!(command.args.contains(&"--no-merges".to_string()));
        assert_eq!(command.args.last().map(String::as_str), Some("src/main.c"));

        settings.include_merges = true;
        let command = list_revisions_command(&settings, Path::new("src/main.c"));
        assert!(!command.args.contains(&"--no-merges".to_string()));
    }

    #[test]
    fn detail_commands_target_the_revision() {
        let settings = ScmSettings {
            executable: "/opt/hg/bin/hg".to_string(),
            mainline_branch: "trunk".to_string(),
            ..ScmSettings::default()
        };
        let file = Path::new("lib.rs");

        let annotate = annotate_command(&settings, file, 42);
        assert_eq!(annotate.program, "/opt/hg/bin/hg");
        assert!(annotate.args.windows(2).any(|pair| pair == ["-r", "42"]));

        let merge_base = merge_base_command(&settings, 42);
        assert!(merge_base
            .args
            .contains(&"first(descendants(42) and branch('trunk'))".to_string()));

        let patch = patch_command(&settings, file, 42);
        assert_eq!(patch.args, vec!["diff", "--change", "42", "lib.rs"]);
    }

    #[test]
    fn details_run_in_order_and_populate_every_field() {
        let runner = Arc::new(ScriptedRunner::new(None));
        let proxy = ScmProxy::new(runner.clone(), ScmSettings::default());
        let request = proxy
            .fetch_revision_details(Path::new("file.c"), Path::new("."), 2)
            .expect("issue");

        let details = wait_for(request).expect("result").expect("details");
        assert_eq!(runner.calls(), vec!["annotate", "mergebase", "diff"]);
        assert_eq!(details.id, 2);
        assert_eq!(details.annotations.len(), 2);
        assert_eq!(
            details.merge_base.as_ref().map(|base| base.summary.as_str()),
            Some("Merge feature")
        );
        assert!(details.patch.contains("+x += 2;"));
    }

    #[test]
    fn failing_step_short_circuits_details() {
        let runner = Arc::new(ScriptedRunner::new(Some("annotate")));
        let proxy = ScmProxy::new(runner.clone(), ScmSettings::default());
        let request = proxy
            .fetch_revision_details(Path::new("file.c"), Path::new("."), 2)
            .expect("issue");

        let result = wait_for(request).expect("result");
        assert!(matches!(result, Err(FetchFailure::Tool { code: 255, .. })));
        assert_eq!(runner.calls(), vec!["annotate"]);

        let runner = Arc::new(ScriptedRunner::new(Some("mergebase")));
        let proxy = ScmProxy::new(runner.clone(), ScmSettings::default());
        let request = proxy
            .fetch_revision_details(Path::new("file.c"), Path::new("."), 2)
            .expect("issue");
        assert!(wait_for(request).expect("result").is_err());
        assert_eq!(runner.calls(), vec!["annotate", "mergebase"]);
    }

    #[test]
    fn list_request_parses_in_worker() {
        let runner = Arc::new(ScriptedRunner::new(None));
        let proxy = ScmProxy::new(runner, ScmSettings::default());
        let request = proxy
            .fetch_revisions(Path::new("file.c"), Path::new("."))
            .expect("issue");
        let revisions = wait_for(request).expect("result").expect("revisions");
        assert_eq!(revisions.len(), 2);
    }

    #[test]
    fn failed_list_reports_tool_failure() {
        let runner = Arc::new(ScriptedRunner::new(Some("log")));
        let proxy = ScmProxy::new(runner, ScmSettings::default());
        let request = proxy
            .fetch_revisions(Path::new("file.c"), Path::new("."))
            .expect("issue");
        let result = wait_for(request).expect("result");
        let failure = result.expect_err("tool failure");
        assert!(failure.to_string().contains("exited with code 255"));
    }

    #[test]
    fn spawn_failures_are_distinguished() {
        let command = CommandLine::new("hg");
        let failure = check_output(&command, CommandOutput::spawn_failure());
        assert_eq!(
            failure,
            Err(FetchFailure::Spawn {
                command: "hg".to_string()
            })
        );
    }

    #[test]
    fn dispose_timeout_is_taken_from_settings() {
        assert_eq!(ScmSettings::default().dispose_timeout, DEFAULT_DISPOSE_TIMEOUT);
    }

    fn field() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_.@+ -]{0,16}".prop_map(|s| s.trim().to_string())
    }

    proptest! {
        #[test]
        fn formatted_record_round_trips(
            id in 0u32..1_000_000,
            author in field(),
            node in "[0-9a-f]{12}",
            age in field(),
            date in "20[0-9]{2}-(0[1-9]|1[0-2])-(0[1-9]|1[0-9]|2[0-8]) ([01][0-9]|2[0-3]):[0-5][0-9] [+-](0[0-9]|1[0-2])00",
            branch in field(),
            description in field(),
        ) {
            let line = format!("{id}|{author}|{node}|{age}|{date}|{branch}|{description}");
            let parsed = parse_revision_line(&line).expect("valid record");
            prop_assert_eq!(parsed.id, id);
            prop_assert_eq!(&parsed.author, &author);
            prop_assert_eq!(&parsed.node, &node);
            prop_assert_eq!(&parsed.age, &age);
            prop_assert_eq!(&parsed.committed_date, &date);
            prop_assert!(parsed.committed_at.is_some());
            prop_assert_eq!(&parsed.branch, &branch);
            prop_assert_eq!(&parsed.description, &description);
            prop_assert_eq!(format_revision_line(&parsed), line);
        }

        #[test]
        fn reparsing_is_deterministic_and_ids_unique(
            ids in proptest::collection::vec(0u32..50, 0..30),
        ) {
            let text: String = ids
                .iter()
                .map(|id| format!("{id}|al|{id:012x}|1d|2024-01-01 10:00 +0000|default|change {id}\n"))
                .collect();
            let first = parse_revision_list(&text);
            let second = parse_revision_list(&text);
            prop_assert_eq!(&first, &second);

            let unique: HashSet<RevisionId> = first.iter().map(|r| r.id).collect();
            prop_assert_eq!(unique.len(), first.len());
            let expected: HashSet<RevisionId> = ids.iter().copied().collect();
            prop_assert_eq!(unique, expected);
        }
    }
}
