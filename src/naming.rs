//! Remote job naming
//!
//! Every execution attempt of a job is submitted under a name that encodes the
//! job kind, the job's primary key and the attempt number:
//!
//! ```text
//! <registry prefix>-<kind code>-<uuid4>-<NN>
//! ```
//!
//! Completion events only carry this name, so parsing it is how an event is
//! routed back to the attempt that produced it. Two attempts of the same job
//! never share a name, which keeps their events, logs and storage apart.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::{Uuid, Variant};

use crate::errors::InvalidNameError;

/// SageMaker limits transform job names to 63 characters
pub const MAX_JOB_NAME_LENGTH: usize = 63;

/// Largest attempt number that fits in the two digit suffix
pub const MAX_ATTEMPT: u8 = 99;

const UUID4_PATTERN: &str =
    r"[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}";

/// The kinds of job that can be executed, keyed by `<app_label>-<model_name>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// An algorithm inference run
    AlgorithmsJob,
    /// An evaluation of a submission
    EvaluationEvaluation,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::AlgorithmsJob, JobKind::EvaluationEvaluation];

    /// Short code used in remote job names. Codes must be short, alphanumeric
    /// and distinct.
    pub fn code(&self) -> &'static str {
        match self {
            JobKind::AlgorithmsJob => "A",
            JobKind::EvaluationEvaluation => "E",
        }
    }

    pub fn app_label(&self) -> &'static str {
        match self {
            JobKind::AlgorithmsJob => "algorithms",
            JobKind::EvaluationEvaluation => "evaluation",
        }
    }

    pub fn model_name(&self) -> &'static str {
        match self {
            JobKind::AlgorithmsJob => "job",
            JobKind::EvaluationEvaluation => "evaluation",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    pub fn from_labels(app_label: &str, model_name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.app_label() == app_label && kind.model_name() == model_name)
    }

    /// Check that the code table can be inverted. Run once at startup.
    pub fn verify_codes() -> Result<(), InvalidNameError> {
        let mut seen = HashSet::new();
        for kind in Self::ALL {
            let code = kind.code();
            if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(InvalidNameError::KindCodes(format!(
                    "code {:?} for {} is not alphanumeric",
                    code, kind
                )));
            }
            if !seen.insert(code) {
                return Err(InvalidNameError::KindCodes(format!(
                    "code {:?} is used more than once",
                    code
                )));
            }
        }
        Ok(())
    }

    fn max_code_len() -> usize {
        Self::ALL.iter().map(|k| k.code().len()).max().unwrap_or(0)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.app_label(), self.model_name())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split_once('-')
            .and_then(|(app_label, model_name)| Self::from_labels(app_label, model_name))
            .ok_or_else(|| format!("Value not valid: {}", s))
    }
}

/// One execution attempt of one logical job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub kind: JobKind,
    pub pk: Uuid,
    pub attempt: u8,
}

impl JobDescriptor {
    pub fn new(kind: JobKind, pk: Uuid, attempt: u8) -> Self {
        Self { kind, pk, attempt }
    }

    pub fn app_label(&self) -> &'static str {
        self.kind.app_label()
    }

    pub fn model_name(&self) -> &'static str {
        self.kind.model_name()
    }

    /// `<app_label>-<model_name>-<pk>-<NN>`, used in log messages
    pub fn job_id(&self) -> String {
        format!("{}-{}-{:02}", self.kind, self.pk, self.attempt)
    }

    /// Object key prefix owned by this attempt, in both the input and output
    /// buckets
    pub fn invocation_prefix(&self) -> String {
        format!(
            "invocations/{}/{}/{}/{:02}",
            self.app_label(),
            self.model_name(),
            self.pk,
            self.attempt
        )
    }

    /// Key of the invocation manifest in the input bucket
    pub fn invocation_key(&self) -> String {
        format!("{}/invocation.json", self.invocation_prefix())
    }

    /// Key of the result object written by the batch transform to the output
    /// bucket
    pub fn result_key(&self) -> String {
        format!("{}.out", self.invocation_key())
    }
}

impl fmt::Display for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.job_id())
    }
}

/// Formats and parses remote job names for one registry prefix
#[derive(Debug, Clone)]
pub struct JobNamer {
    prefix: String,
    pattern: Regex,
}

impl JobNamer {
    /// Create a namer, validating that every name it produces will fit the
    /// provider's length and charset limits
    pub fn new(prefix: &str) -> Result<Self, InvalidNameError> {
        let prefix_error = |reason| InvalidNameError::Prefix(prefix.to_string(), reason);

        if prefix.is_empty() {
            return Err(prefix_error("must not be empty"));
        }
        if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(prefix_error("may only contain ASCII letters, digits and '-'"));
        }
        if prefix.starts_with('-') || prefix.ends_with('-') {
            return Err(prefix_error("must not start or end with '-'"));
        }

        // <prefix>-<code>-<36 char uuid>-<NN>
        let fixed_len = 1 + JobKind::max_code_len() + 1 + 36 + 1 + 2;
        if prefix.len() + fixed_len > MAX_JOB_NAME_LENGTH {
            return Err(prefix_error("is too long for a 63 character job name"));
        }

        let codes: Vec<String> = JobKind::ALL
            .iter()
            .map(|k| regex::escape(k.code()))
            .collect();
        let pattern = Regex::new(&format!(
            r"^{}-(?P<code>{})-(?P<pk>{})-(?P<attempt>\d{{2}})$",
            regex::escape(prefix),
            codes.join("|"),
            UUID4_PATTERN
        ))
        .map_err(|_| prefix_error("cannot be used in a name pattern"))?;

        Ok(Self {
            prefix: prefix.to_string(),
            pattern,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn format(&self, descriptor: &JobDescriptor) -> Result<String, InvalidNameError> {
        if descriptor.attempt > MAX_ATTEMPT {
            return Err(InvalidNameError::Attempt(descriptor.attempt.into()));
        }
        // Only random (v4) keys can be parsed back out of a name
        let pk = descriptor.pk;
        if pk.get_version_num() != 4 || pk.get_variant() != Variant::RFC4122 {
            return Err(InvalidNameError::NotUuid4(descriptor.pk));
        }
        Ok(format!(
            "{}-{}-{}-{:02}",
            self.prefix,
            descriptor.kind.code(),
            descriptor.pk.as_hyphenated(),
            descriptor.attempt
        ))
    }

    pub fn parse(&self, name: &str) -> Result<JobDescriptor, InvalidNameError> {
        let malformed = || InvalidNameError::Malformed(name.to_string());

        let captures = self.pattern.captures(name).ok_or_else(malformed)?;
        let kind = JobKind::from_code(&captures["code"]).ok_or_else(malformed)?;
        let pk = Uuid::parse_str(&captures["pk"]).map_err(|_| malformed())?;
        let attempt = captures["attempt"].parse().map_err(|_| malformed())?;

        Ok(JobDescriptor { kind, pk, attempt })
    }

    /// Recover the job reference from a transform job state change event
    pub fn parse_event(&self, event: &serde_json::Value) -> Result<JobDescriptor, InvalidNameError> {
        let name = event
            .get("TransformJobName")
            .and_then(|v| v.as_str())
            .ok_or(InvalidNameError::MissingName)?;
        self.parse(name)
    }
}
