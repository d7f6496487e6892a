pub mod app;
pub mod event_handler;
pub mod log_layer;
pub mod ui;
pub mod widgets;

pub use app::DashboardApp;
pub use event_handler::handle_events;
