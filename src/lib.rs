//! Host side print job streaming: file catalog, the print job controller and
//! its work cycle, crash-resume records, layer timelapse and status glue.

pub mod capture;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gcode;
pub mod machine;
pub mod notify;
pub mod print_job;
pub mod print_stats;
pub mod reactor;
pub mod resume;
pub mod timelapse;
pub mod web;
