//! Wire contract for the loopback control plane.
//!
//! Every method is a JSON `POST /control/<method>` with a request body and a
//! reply body. Replies always carry `success` and `message`; failures are
//! reported in-band with HTTP 200 so the caller never has to guess.

use serde::{Deserialize, Serialize};

/// Path prefix shared by all methods.
pub const CONTROL_PATH_PREFIX: &str = "/control";

/// Header carrying a per-call correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Control-plane methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Controller → worker: enable or disable listening.
    SetActive,
    /// Worker → controller: answer a free-form question.
    Ask,
    /// Worker → controller: resolve a city name.
    City,
    /// Worker → controller: current weather for a city.
    Weather,
    /// Worker → controller: show or hide the assistant surface.
    SetVisible,
}

/// Which process serves a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Served by the worker, called by the controller.
    ToWorker,
    /// Served by the controller, called by the worker.
    ToController,
}

impl Method {
    pub const ALL: [Self; 5] = [
        Self::SetActive,
        Self::Ask,
        Self::City,
        Self::Weather,
        Self::SetVisible,
    ];

    /// Render method name to wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SetActive => "set_active",
            Self::Ask => "ask",
            Self::City => "city",
            Self::Weather => "weather",
            Self::SetVisible => "set_visible",
        }
    }

    /// Parse method name from wire format.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == raw)
    }

    /// HTTP path for this method.
    #[must_use]
    pub fn path(self) -> String {
        format!("{CONTROL_PATH_PREFIX}/{}", self.as_str())
    }

    #[must_use]
    pub fn direction(self) -> Direction {
        match self {
            Self::SetActive => Direction::ToWorker,
            Self::Ask | Self::City | Self::Weather | Self::SetVisible => Direction::ToController,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply types that can express a failure in-band.
pub trait Reply: Serialize + Send + 'static {
    fn failure(message: impl Into<String>) -> Self;
    fn is_success(&self) -> bool;
    fn message(&self) -> &str;
}

/// Generic success/failure reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl StatusReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

impl Reply for StatusReply {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }

    fn is_success(&self) -> bool {
        self.success
    }

    fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetActiveRequest {
    pub active: bool,
    /// Capture device to use when activating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub microphone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskReply {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub answer: String,
}

impl AskReply {
    pub fn answered(answer: impl Into<String>) -> Self {
        Self {
            success: true,
            message: String::new(),
            answer: answer.into(),
        }
    }
}

impl Reply for AskReply {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            answer: String::new(),
        }
    }

    fn is_success(&self) -> bool {
        self.success
    }

    fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CityRequest {
    pub city: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CityReply {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    /// Canonical "City, Country" name when the lookup matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
}

impl CityReply {
    pub fn found(full_name: impl Into<String>) -> Self {
        Self {
            success: true,
            message: String::new(),
            full_name: Some(full_name.into()),
        }
    }
}

impl Reply for CityReply {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            full_name: None,
        }
    }

    fn is_success(&self) -> bool {
        self.success
    }

    fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeatherRequest {
    pub city: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReply {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub description: String,
    /// Degrees Celsius.
    #[serde(default)]
    pub temperature: f64,
}

impl WeatherReply {
    pub fn report(city: impl Into<String>, description: impl Into<String>, temperature: f64) -> Self {
        Self {
            success: true,
            message: String::new(),
            city: city.into(),
            description: description.into(),
            temperature,
        }
    }
}

impl Reply for WeatherReply {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            city: String::new(),
            description: String::new(),
            temperature: 0.0,
        }
    }

    fn is_success(&self) -> bool {
        self.success
    }

    fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetVisibleRequest {
    pub visible: bool,
}
