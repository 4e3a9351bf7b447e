use clap::{Parser, Subcommand};
use colored::*;
use rpassword::prompt_password;
use std::process;

use spnego::ntlm::crypto::{nt_hash, ntowfv2};
use spnego::ntlm::{AvPair, NtlmMessage};
use spnego::{Error, NegotiationToken};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Log level, overridden by RUST_LOG
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the NT hash and NTOWFv2 key for an account
    Hash {
        #[arg(short, long, env = "SPNEGO_USERNAME")]
        username: String,

        #[arg(short, long, env = "SPNEGO_DOMAIN", default_value = "")]
        domain: String,

        #[arg(short, long, env = "SPNEGO_PASSWORD")]
        password: Option<String>,
    },

    /// Pretty-print a hex-encoded SPNEGO or NTLM token
    Decode {
        /// Token bytes as hex
        token: String,
    },
}

fn main() {
    let args = CliArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match args.command {
        Command::Hash { username, domain, password } => {
            let password = password.unwrap_or_else(read_password);
            print_hashes(&username, &domain, &password);
            Ok(())
        }
        Command::Decode { token } => decode(&token),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

fn read_password() -> String {
    tracing::debug!("password not given, prompting");
    match prompt_password(format!("{}: ", "Enter password".yellow())) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{} {}", "Error reading password:".red(), e);
            process::exit(1);
        }
    }
}

fn print_hashes(username: &str, domain: &str, password: &str) {
    let hash = nt_hash(password);
    let key = ntowfv2(&hash, username, domain);
    println!("{} {}", "NT hash:".cyan(), hex::encode(hash).green());
    println!(
        "{} {}{}{} {}",
        "NTOWFv2".cyan(),
        "(".white().bold(),
        format!("{}\\{}", domain, username).blue(),
        "):".white().bold(),
        hex::encode(key).magenta()
    );
}

fn decode(token: &str) -> Result<(), Error> {
    let bytes = hex::decode(token.trim())?;
    if NtlmMessage::is_ntlm(&bytes) {
        print_ntlm(&NtlmMessage::decode(&bytes)?, 0);
        return Ok(());
    }
    match NegotiationToken::decode(&bytes)? {
        NegotiationToken::Init(init) => {
            println!("{}", "NegTokenInit".cyan().bold());
            let mechs: Vec<String> = init.mech_types.iter().map(ToString::to_string).collect();
            println!("  {} {}", "mechTypes:".white().bold(), mechs.join(", ").blue());
            if let Some(hints) = &init.neg_hints {
                println!("  {} {:?}", "negHints:".white().bold(), hints.hint_name);
            }
            print_inner("mechToken", init.mech_token.as_deref());
            print_inner("mechListMIC", init.mech_list_mic.as_deref());
        }
        NegotiationToken::Response(resp) => {
            println!("{}", "NegTokenResp".cyan().bold());
            if let Some(state) = resp.neg_state {
                println!("  {} {:?}", "negState:".white().bold(), state);
            }
            if let Some(mech) = &resp.supported_mech {
                println!("  {} {}", "supportedMech:".white().bold(), mech.to_string().blue());
            }
            print_inner("responseToken", resp.response_token.as_deref());
            print_inner("mechListMIC", resp.mech_list_mic.as_deref());
        }
    }
    Ok(())
}

fn print_inner(label: &str, data: Option<&[u8]>) {
    let Some(data) = data else {
        return;
    };
    println!("  {} {}", format!("{label}:").white().bold(), hex::encode(data).bright_black());
    if NtlmMessage::is_ntlm(data) {
        match NtlmMessage::decode(data) {
            Ok(message) => print_ntlm(&message, 4),
            Err(e) => eprintln!("{} {}", "Warning: inner NTLM message did not decode:".yellow(), e),
        }
    }
}

fn print_ntlm(message: &NtlmMessage, indent: usize) {
    let pad = " ".repeat(indent);
    match message {
        NtlmMessage::Negotiate(msg) => {
            println!("{pad}{}", "NTLM NEGOTIATE".green().bold());
            println!("{pad}  flags: {:?}", msg.flags);
            println!("{pad}  domain: {:?}  workstation: {:?}", msg.domain_name, msg.workstation);
        }
        NtlmMessage::Challenge(msg) => {
            println!("{pad}{}", "NTLM CHALLENGE".green().bold());
            println!("{pad}  flags: {:?}", msg.flags);
            println!("{pad}  target: {:?}", msg.target_name);
            println!("{pad}  challenge: {}", hex::encode(msg.server_challenge).magenta());
            for pair in &msg.target_info.0 {
                print_av_pair(pair, &pad);
            }
        }
        NtlmMessage::Authenticate(msg) => {
            println!("{pad}{}", "NTLM AUTHENTICATE".green().bold());
            println!("{pad}  flags: {:?}", msg.flags);
            println!(
                "{pad}  user: {}  workstation: {:?}",
                format!("{}\\{}", msg.domain_name, msg.user_name).blue(),
                msg.workstation
            );
            println!("{pad}  nt response: {} bytes", msg.nt_challenge_response.len());
            if let Some(mic) = msg.mic {
                println!("{pad}  mic: {}", hex::encode(mic).bright_black());
            }
        }
    }
}

fn print_av_pair(pair: &AvPair, pad: &str) {
    println!("{pad}  {} {:?}", "av:".white().bold(), pair);
}
