pub(crate) mod health_check_controller;
pub(crate) mod room_controller;
pub(crate) mod stream_controller;
