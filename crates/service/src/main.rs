mod cli;

use clap::{Parser, Subcommand};
use cli::{args::Args, op::Op, Authority, Enrollments, Init, Login, Ping, Revoke, Run, Setup, Version};

command_enum! {
    (Authority, Authority),
    (Enrollments, Enrollments),
    (Init, Init),
    (Login, Login),
    (Ping, Ping),
    (Revoke, Revoke),
    (Run, Run),
    (Setup, Setup),
    (Version, Version),
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let ctx = cli::op::OpContext::new(args.data_dir);

    match args.command.execute(&ctx).await {
        Ok(output) => {
            println!("{}", output);
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
