//! Loopback control plane between the controller and the worker.
//!
//! Two independent endpoints: the worker serves `set_active` and the
//! controller ([`ControlPlaneHost`]) serves the worker's callbacks. Both use
//! JSON over HTTP on 127.0.0.1 as described in [`contract`].

pub mod client;
pub mod contract;
pub mod host;
pub mod ui;

pub use client::ControlChannel;
pub use contract::{
    AskReply, AskRequest, CityReply, CityRequest, Direction, Method, Reply, SetActiveRequest, SetVisibleRequest,
    StatusReply, WeatherReply, WeatherRequest,
};
pub use host::{ControlPlaneHost, HostServices, NoopHostServices, WeatherReport};
pub use ui::{LoggingSurface, UiContext, UiDispatcher, UiError, UiLoop, UiSurface};
