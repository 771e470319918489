use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use cipherbox_stream::crypto::{self, chunked, ctr_stream};
use cipherbox_stream::{CipherKind, MediaService, PlayerControl, ServerConfig};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "cipherbox-stream", version, about = "Stream local media over HTTP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve files until stdin is closed (Ctrl-D)
    Serve {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long)]
        ip: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        max_workers: Option<usize>,
        #[arg(long, value_enum)]
        cipher: Option<CipherKind>,
        #[arg(long)]
        kdf_iterations: Option<u32>,
    },
    /// Encrypt a file for streaming
    Encrypt {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        password: String,
        /// Write the chunked container instead of a CTR stream
        #[arg(long)]
        chunked: bool,
        #[arg(long, default_value_t = crypto::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        #[arg(long, default_value_t = crypto::DEFAULT_ITERATIONS)]
        kdf_iterations: u32,
    },
}

/// Stands in for a real player: logs control requests.
struct LoggingPlayer;

impl PlayerControl for LoggingPlayer {
    fn play_pause(&self) {
        log::info!("Play/pause requested");
    }

    fn seek(&self, position: Duration) {
        log::info!("Seek to {:?} requested", position);
    }

    fn set_position_fraction(&self, fraction: f64) {
        log::info!("Seek to {:.1}% requested", fraction * 100.0);
    }
}

fn serve(
    files: Vec<PathBuf>,
    ip: Option<String>,
    port: Option<u16>,
    max_workers: Option<usize>,
    cipher: Option<CipherKind>,
    kdf_iterations: Option<u32>,
) -> CliResult {
    let mut config = ServerConfig::from_env()?;
    if let Some(ip) = ip {
        config.ip = ip;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(max_workers) = max_workers {
        config.max_workers = max_workers;
    }
    if let Some(cipher) = cipher {
        config.cipher = cipher;
    }
    if let Some(iterations) = kdf_iterations {
        config.kdf_iterations = iterations;
    }

    let service = MediaService::new(config)?;
    service.attach_player(Arc::new(LoggingPlayer));

    for file in &files {
        let url = service.open(file)?;
        println!("{}\t{}", url, file.display());
    }
    log::info!("Serving {} file(s); close stdin to stop", files.len());

    // block until EOF; the streamed content is irrelevant
    for line in io::stdin().lock().lines() {
        line?;
    }

    for file in &files {
        service.close(file);
    }
    service.shutdown();
    Ok(())
}

fn encrypt(
    input: PathBuf,
    output: PathBuf,
    password: String,
    use_chunked: bool,
    chunk_size: usize,
    kdf_iterations: u32,
) -> CliResult {
    if !use_chunked {
        let written = ctr_stream::encrypt_file(&input, &output, &password, kdf_iterations)?;
        println!("{} bytes written to {}", written, output.display());
        return Ok(());
    }

    let job = chunked::encrypt_file_in_background(
        input,
        output.clone(),
        password,
        kdf_iterations,
        chunk_size,
        |_| {},
    )?;
    let mut reported = -10;
    while !job.is_completed() {
        let percent = (job.progress() * 100.0) as i32;
        if percent / 10 != reported / 10 {
            log::info!("Encrypting: {}%", percent);
            reported = percent;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    let header = job.wait()?;
    println!(
        "{} bytes in {} chunks written to {}",
        header.decrypted_len(),
        header.chunks.len(),
        output.display()
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    log::info!("cipherbox-stream starting...");

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve {
            files,
            ip,
            port,
            max_workers,
            cipher,
            kdf_iterations,
        } => serve(files, ip, port, max_workers, cipher, kdf_iterations),
        Command::Encrypt {
            input,
            output,
            password,
            chunked,
            chunk_size,
            kdf_iterations,
        } => encrypt(input, output, password, chunked, chunk_size, kdf_iterations),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
