#[macro_use]
extern crate log;
extern crate dotenv;

use std::process;

use dotenv::dotenv;
use env_logger::Env;
use structopt::StructOpt;

use xvfb_supervisor::app::Application;
use xvfb_supervisor::common::Settings;

#[derive(StructOpt)]
#[structopt(
    name = "xvfb-supervisor",
    about = "Supervises a virtual display session and the processes bound to it"
)]
struct Options {
    /// Path to the YAML configuration file
    #[structopt(short, long, default_value = "config.yml")]
    config: String,

    /// Display number for the virtual display
    #[structopt(short, long)]
    display: Option<u32>,

    /// Screen width in pixels
    #[structopt(long)]
    width: Option<u32>,

    /// Screen height in pixels
    #[structopt(long)]
    height: Option<u32>,

    /// Colour depth in bits
    #[structopt(long)]
    depth: Option<u32>,

    /// Suppress subprocess stderr forwarding
    #[structopt(long)]
    silent: bool,

    /// Shared application command and its arguments
    command: Vec<String>,
}

fn main() {
    dotenv().ok();

    let options = Options::from_args();

    let mut settings = Settings::new(&options.config).expect("Loaded settings");

    if let Some(display) = options.display {
        settings.display.number = display;
    }
    if let Some(width) = options.width {
        settings.display.geometry.width = width;
    }
    if let Some(height) = options.height {
        settings.display.geometry.height = height;
    }
    if let Some(depth) = options.depth {
        settings.display.geometry.depth = depth;
    }
    if options.silent {
        settings.display.silent = true;
    }
    if let Some((command, args)) = options.command.split_first() {
        settings.app.command = command.clone();
        settings.app.args = args.to_vec();
    }

    let env = Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, &settings.logging);
    env_logger::init_from_env(env);

    // Verify settings
    if !settings.verify() {
        error!("Settings are not valid");
        process::exit(1);
    }

    if let Err(error) = Application::new().run(&settings) {
        error!("{}", error);
        process::exit(1);
    }
}
