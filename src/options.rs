//! Generic completion request and the per-backend field rename tables.
//!
//! Tables only rename: values are never changed, and fields a backend has no
//! counterpart for are dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backend::BackendKind;

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "u8", into = "u8")]
pub enum MirostatMode {
    Off,
    V1,
    #[default]
    V2,
}

impl MirostatMode {
    pub fn is_on(self) -> bool {
        self != Self::Off
    }
}

impl From<MirostatMode> for u8 {
    fn from(mode: MirostatMode) -> u8 {
        match mode {
            MirostatMode::Off => 0,
            MirostatMode::V1 => 1,
            MirostatMode::V2 => 2,
        }
    }
}

impl TryFrom<u8> for MirostatMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Off),
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(format!("invalid mirostat mode {other}, expected 0, 1 or 2")),
        }
    }
}

/// Sampling parameters shared by every backend.
/// Defaults match what the editor front end starts with.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SamplingOptions {
    pub temperature: f64,
    pub repeat_penalty: f64,
    pub repeat_last_n: i64,
    pub penalize_nl: bool,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
    pub top_k: i64,
    pub top_p: f64,
    pub typical_p: f64,
    pub tfs_z: f64,
    pub mirostat: MirostatMode,
    pub mirostat_tau: f64,
    pub mirostat_eta: f64,
    pub ignore_eos: bool,
    pub seed: Option<i64>,
    pub max_tokens: Option<i64>,
    pub stop: Vec<String>,
    /// Number of per-token alternatives to read back (0 disables).
    pub n_probs: u32,
    pub context_length: Option<u32>,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            repeat_penalty: 1.1,
            repeat_last_n: 256,
            penalize_nl: true,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            top_k: 40,
            top_p: 0.95,
            typical_p: 1.0,
            tfs_z: 1.0,
            mirostat: MirostatMode::V2,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            ignore_eos: false,
            seed: None,
            max_tokens: None,
            stop: Vec::new(),
            n_probs: 10,
            context_length: None,
        }
    }
}

/// A finished prompt plus the options to generate with.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub options: SamplingOptions,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, options: SamplingOptions) -> Self {
        Self {
            prompt: prompt.into(),
            options,
        }
    }

    /// Generic `(field, value)` pairs that would be sent, before renaming.
    ///
    /// With mirostat on, top-k/top-p/typical/tail-free are left out; with it
    /// off, tau and eta are. Unset optional fields are left out.
    pub fn fields(&self) -> Vec<(Field, Value)> {
        let o = &self.options;
        let mut fields = vec![
            (Field::Prompt, Value::from(self.prompt.as_str())),
            (Field::Temperature, Value::from(o.temperature)),
            (Field::RepeatPenalty, Value::from(o.repeat_penalty)),
            (Field::RepeatLastN, Value::from(o.repeat_last_n)),
            (Field::PenalizeNl, Value::from(o.penalize_nl)),
            (Field::PresencePenalty, Value::from(o.presence_penalty)),
            (Field::FrequencyPenalty, Value::from(o.frequency_penalty)),
            (Field::Mirostat, Value::from(u8::from(o.mirostat))),
        ];

        if o.mirostat.is_on() {
            fields.push((Field::MirostatTau, Value::from(o.mirostat_tau)));
            fields.push((Field::MirostatEta, Value::from(o.mirostat_eta)));
        } else {
            fields.push((Field::TopK, Value::from(o.top_k)));
            fields.push((Field::TopP, Value::from(o.top_p)));
            fields.push((Field::TypicalP, Value::from(o.typical_p)));
            fields.push((Field::TfsZ, Value::from(o.tfs_z)));
        }

        fields.push((Field::IgnoreEos, Value::from(o.ignore_eos)));
        if let Some(seed) = o.seed {
            fields.push((Field::Seed, Value::from(seed)));
        }
        if let Some(max_tokens) = o.max_tokens {
            fields.push((Field::MaxTokens, Value::from(max_tokens)));
        }
        if !o.stop.is_empty() {
            fields.push((Field::Stop, Value::from(o.stop.clone())));
        }
        if o.n_probs > 0 {
            fields.push((Field::NProbs, Value::from(o.n_probs)));
        }
        if let Some(context_length) = o.context_length {
            fields.push((Field::ContextLength, Value::from(context_length)));
        }
        fields
    }
}

/// Generic request field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Prompt,
    Temperature,
    RepeatPenalty,
    RepeatLastN,
    PenalizeNl,
    PresencePenalty,
    FrequencyPenalty,
    TopK,
    TopP,
    TypicalP,
    TfsZ,
    Mirostat,
    MirostatTau,
    MirostatEta,
    IgnoreEos,
    Seed,
    MaxTokens,
    Stop,
    NProbs,
    ContextLength,
}

impl Field {
    pub const ALL: [Field; 20] = [
        Field::Prompt,
        Field::Temperature,
        Field::RepeatPenalty,
        Field::RepeatLastN,
        Field::PenalizeNl,
        Field::PresencePenalty,
        Field::FrequencyPenalty,
        Field::TopK,
        Field::TopP,
        Field::TypicalP,
        Field::TfsZ,
        Field::Mirostat,
        Field::MirostatTau,
        Field::MirostatEta,
        Field::IgnoreEos,
        Field::Seed,
        Field::MaxTokens,
        Field::Stop,
        Field::NProbs,
        Field::ContextLength,
    ];
}

/// llama.cpp server `/completion`.
const DIRECT_HTTP_FIELDS: &[(Field, &str)] = &[
    (Field::Prompt, "prompt"),
    (Field::Temperature, "temperature"),
    (Field::RepeatPenalty, "repeat_penalty"),
    (Field::RepeatLastN, "repeat_last_n"),
    (Field::PenalizeNl, "penalize_nl"),
    (Field::PresencePenalty, "presence_penalty"),
    (Field::FrequencyPenalty, "frequency_penalty"),
    (Field::TopK, "top_k"),
    (Field::TopP, "top_p"),
    (Field::TypicalP, "typical_p"),
    (Field::TfsZ, "tfs_z"),
    (Field::Mirostat, "mirostat"),
    (Field::MirostatTau, "mirostat_tau"),
    (Field::MirostatEta, "mirostat_eta"),
    (Field::IgnoreEos, "ignore_eos"),
    (Field::Seed, "seed"),
    (Field::MaxTokens, "n_predict"),
    (Field::Stop, "stop"),
    (Field::NProbs, "n_probs"),
    (Field::ContextLength, "n_ctx"),
];

/// text-generation-webui streaming API.
const WEBSOCKET_FIELDS: &[(Field, &str)] = &[
    (Field::Prompt, "prompt"),
    (Field::Temperature, "temperature"),
    (Field::RepeatPenalty, "repetition_penalty"),
    (Field::RepeatLastN, "repetition_penalty_range"),
    (Field::PresencePenalty, "presence_penalty"),
    (Field::FrequencyPenalty, "frequency_penalty"),
    (Field::TopK, "top_k"),
    (Field::TopP, "top_p"),
    (Field::TypicalP, "typical_p"),
    (Field::TfsZ, "tfs"),
    (Field::Mirostat, "mirostat_mode"),
    (Field::MirostatTau, "mirostat_tau"),
    (Field::MirostatEta, "mirostat_eta"),
    (Field::IgnoreEos, "ban_eos_token"),
    (Field::Seed, "seed"),
    (Field::MaxTokens, "max_new_tokens"),
    (Field::Stop, "stopping_strings"),
    (Field::ContextLength, "truncation_length"),
];

/// KoboldCpp `/api/extra/generate/stream`.
const ABORTABLE_HTTP_FIELDS: &[(Field, &str)] = &[
    (Field::Prompt, "prompt"),
    (Field::Temperature, "temperature"),
    (Field::RepeatPenalty, "rep_pen"),
    (Field::RepeatLastN, "rep_pen_range"),
    (Field::TopK, "top_k"),
    (Field::TopP, "top_p"),
    (Field::TypicalP, "typical"),
    (Field::TfsZ, "tfs"),
    (Field::Mirostat, "mirostat"),
    (Field::MirostatTau, "mirostat_tau"),
    (Field::MirostatEta, "mirostat_eta"),
    (Field::IgnoreEos, "use_default_badwordsids"),
    (Field::Seed, "sampler_seed"),
    (Field::MaxTokens, "max_length"),
    (Field::Stop, "stop_sequence"),
    (Field::ContextLength, "max_context_length"),
];

pub fn field_table(kind: BackendKind) -> &'static [(Field, &'static str)] {
    match kind {
        BackendKind::DirectHttpStream => DIRECT_HTTP_FIELDS,
        BackendKind::WebSocketStream => WEBSOCKET_FIELDS,
        BackendKind::HttpStreamWithAbort => ABORTABLE_HTTP_FIELDS,
    }
}

/// Wire name of `field` on `kind`, or None if the backend has no counterpart.
pub fn wire_name(kind: BackendKind, field: Field) -> Option<&'static str> {
    field_table(kind)
        .iter()
        .find(|(f, _)| *f == field)
        .map(|(_, name)| *name)
}

/// Build the backend's native request body.
pub fn translate(kind: BackendKind, request: &CompletionRequest) -> Map<String, Value> {
    request
        .fields()
        .into_iter()
        .filter_map(|(field, value)| wire_name(kind, field).map(|name| (name.to_string(), value)))
        .collect()
}

/// Map a native request body back onto generic fields. Unknown keys are skipped.
pub fn untranslate(kind: BackendKind, body: &Map<String, Value>) -> Vec<(Field, Value)> {
    field_table(kind)
        .iter()
        .filter_map(|(field, name)| body.get(*name).map(|value| (*field, value.clone())))
        .collect()
}
