use clap::Parser;

mod cli;
mod html;
mod monitor;

fn main() {
    if let Err(err) = cli::handle_commands(cli::Cli::parse()) {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}
