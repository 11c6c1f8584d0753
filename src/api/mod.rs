pub mod central;
pub mod central_event;
pub mod characteristic;
pub mod descriptor;
pub mod peripheral;
pub mod scan_result;
pub mod service;
pub mod subscription;
pub mod transfer;
