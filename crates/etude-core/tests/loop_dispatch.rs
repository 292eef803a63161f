// tests/loop_dispatch.rs
//! Loop performs socket I/O; level-triggered listener and connections.
mod common;

use std::net::SocketAddr;
use std::sync::OnceLock;

use etude_core::{DispatchMode, TriggerMode};

use common::Running;

fn running() -> &'static Running {
    static SERVER: OnceLock<Running> = OnceLock::new();
    SERVER.get_or_init(|| common::start(DispatchMode::LoopDrivesIo, TriggerMode::LtLt))
}

fn server() -> SocketAddr {
    running().addr
}

#[test]
fn serves_judge_page_for_root() {
    common::serves_judge_page_for_root(server());
}

#[test]
fn keep_alive_serves_several_requests() {
    common::keep_alive_serves_several_requests(server());
}

#[test]
fn error_statuses_close_the_connection() {
    common::error_statuses_close_the_connection(server());
}

#[test]
fn malformed_requests_get_not_found() {
    common::malformed_requests_get_not_found(server());
}

#[test]
fn empty_file_gets_placeholder_body() {
    common::empty_file_gets_placeholder_body(server());
}

#[test]
fn absolute_form_target_is_accepted() {
    common::absolute_form_target_is_accepted(server());
}

#[test]
fn route_digits_pick_fixed_pages() {
    common::route_digits_pick_fixed_pages(server());
}

#[test]
fn register_then_login() {
    common::register_then_login(server(), "bob");
}

#[test]
fn request_split_across_writes() {
    common::request_split_across_writes(server());
}

#[test]
fn concurrent_clients() {
    common::concurrent_clients(server());
}

#[test]
fn idle_connection_is_evicted() {
    common::idle_connection_is_evicted(running());
}

#[test]
fn large_file_arrives_intact() {
    common::large_file_arrives_intact(server());
}
