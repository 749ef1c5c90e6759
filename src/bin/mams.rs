use clap::Parser;

fn main() {
    let cli = mams_cli::Cli::parse();
    std::process::exit(mams_cli::run(cli));
}
