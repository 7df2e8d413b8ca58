//! banrelay-ctl: CLI tool for building, inspecting and decoding ban-record data.

use std::fs;
use std::io::{Read, Write};
use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use banrelay::frame::{self, Frame};
use banrelay::record::{decode_name, ticks_now, RecordBuilder, TICKS_PER_SECOND};

#[derive(Parser)]
#[command(name = "banrelay-ctl")]
#[command(version = "0.1.0")]
#[command(about = "Build, inspect and decode ban-record messages", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a single-record producer message
    Build {
        /// Ban lifetime in seconds from now
        #[arg(short, long, default_value_t = 600)]
        expires_in: u64,

        /// Address or CIDR prefix to ban (repeatable)
        #[arg(short, long)]
        addr: Vec<String>,

        /// Port to ban (repeatable)
        #[arg(short, long)]
        port: Vec<u16>,

        /// IP protocol number (6 = TCP, 17 = UDP)
        #[arg(long)]
        protocol: Option<u8>,

        /// Output file (stdout summary is always printed)
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Print the records held in a message or checkpoint file
    Dump {
        /// Message or gzip checkpoint file
        input: PathBuf,
    },

    /// Decode a self-describing rule name
    DecodeName {
        /// Rule name as installed in the packet filter
        name: String,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Build {
            expires_in,
            addr,
            port,
            protocol,
            output,
        } => build_message(expires_in, &addr, &port, protocol, &output),
        Commands::Dump { input } => dump_file(&input),
        Commands::DecodeName { name } => decode_rule_name(&name),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn build_message(
    expires_in: u64,
    addrs: &[String],
    ports: &[u16],
    protocol: Option<u8>,
    output: &PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    if addrs.is_empty() && ports.is_empty() && protocol.is_none() {
        return Err("nothing to ban: give at least one --addr, --port or --protocol".into());
    }

    let expiration = ticks_now() + expires_in as i64 * TICKS_PER_SECOND;
    let mut builder = RecordBuilder::new(expiration);

    for spec in addrs {
        match spec.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse()?;
                builder.add_addr_prefix(addr, prefix.parse()?);
            }
            None => builder.add_addr(spec.parse()?),
        }
    }
    for port in ports {
        builder.add_port(*port);
    }
    if let Some(protocol) = protocol {
        builder.add_protocol(protocol);
    }

    let record = builder.build();
    let message = frame::encode_record_message(&record);
    fs::File::create(output)?.write_all(&message)?;

    println!("{}", record);
    println!("rule name: {}", record.rule_name());
    println!("wrote {} bytes to {:?}", message.len(), output);
    Ok(())
}

fn dump_file(input: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let raw = fs::read(input)?;

    // checkpoint files are gzip streams of frames, messages are plain
    let bytes = if raw.starts_with(&[0x1f, 0x8b]) {
        let mut inflated = Vec::new();
        flate2::read::GzDecoder::new(&raw[..]).read_to_end(&mut inflated)?;
        inflated
    } else {
        raw
    };

    let frames = frame::read_message(&bytes)?;
    let mut records = 0usize;
    for item in frames {
        match item {
            Frame::Record(record) => {
                records += 1;
                println!("{}", record);
                println!("  rule name: {}", record.rule_name());
            }
            Frame::Subscribe(reg) => {
                println!("SUBSCRIBE {} -> queue {}", reg.requester, reg.queue_name())
            }
            Frame::Unsubscribe(reg) => {
                println!("UNSUBSCRIBE {} -> queue {}", reg.requester, reg.queue_name())
            }
        }
    }

    println!("{} records in {:?}", records, input);
    Ok(())
}

fn decode_rule_name(name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (expiration, hash) = decode_name(name)?;
    let now = ticks_now();

    println!("expiration: {} ticks", expiration);
    println!("hash:       {}", banrelay::record::hex_colon(&hash));
    if expiration > now {
        println!("expires in: {} s", (expiration - now) / TICKS_PER_SECOND);
    } else {
        println!("expired {} s ago", (now - expiration) / TICKS_PER_SECOND);
    }
    Ok(())
}
