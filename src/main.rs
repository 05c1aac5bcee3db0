use std::env;
use std::process;

use webserv::config::Config;
use webserv::error::ServerError;
use webserv::handler::Router;
use webserv::server::{self, Server};

extern "C" fn on_signal(_signum: libc::c_int) {
    server::request_shutdown();
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn run() -> Result<(), ServerError> {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(&config_path)?;
    config.validate()?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging().level.clone()),
    )
    .init();

    install_signal_handlers();
    server::reset_shutdown();

    let mut server = Server::new(config, Box::new(Router::with_default_routes()))?;
    server.bind()?;
    server.run()
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
