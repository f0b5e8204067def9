// cli/src/main.rs
use colored::*;
use snipper_cli::cli::AppCommand;
use structopt::StructOpt;

fn main() {
    let cmd = AppCommand::from_args();
    if let Err(e) = cmd.execute() {
        eprintln!("{} {:#}", "[ERROR]".red(), e);
        std::process::exit(1);
    }
}
