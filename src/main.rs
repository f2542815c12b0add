use clap::Parser;
use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use tracing::error;
use tracing_subscriber::EnvFilter;

use kadnode::cli::{self, Command};
use kadnode::{KademliaNode, DEFAULT_BOOTSTRAP, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(name = "kadnode", about = "Kademlia DHT node")]
struct Args {
    /// UDP port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Peer to join the network through
    #[arg(long, default_value = DEFAULT_BOOTSTRAP)]
    bootstrap: SocketAddr,

    /// Start without joining a network (first node)
    #[arg(long)]
    standalone: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut builder = KademliaNode::builder();
    builder.port(args.port);
    if !args.standalone {
        builder.bootstrap(args.bootstrap);
    }

    let node = match builder.start().await {
        Ok(node) => node,
        Err(err) => {
            error!("can't start node: {err}");
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    loop {
        print!("Enter a command: ");
        _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        match cli::parse(&line) {
            Ok(Command::Put(data)) => {
                let key = node.store(&data).await;
                println!("The value has been uploaded under {key}");
            }
            Ok(Command::Get(key)) => match node.lookup_data(&key).await {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("The requested value could not be found"),
            },
            Ok(Command::Show) => println!("{}", node.dump_routes()),
            Ok(Command::Exit) => break,
            Err(err) => println!("{err}"),
        }
    }
}
