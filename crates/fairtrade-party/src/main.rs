//! Fairtrade Party CLI
//!
//! Command-line driver for file-based trades:
//! - Publishing a dataset (items, bulletin, public parameters)
//! - Running a seller/buyer trade with every message written to disk
//! - Verifying claims against a bulletin
//! - Inspecting message blobs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fairtrade_core::codec::{read_message, write_message};
use fairtrade_core::dataset::{BULLETIN_FILE, PUBLIC_FILE};
use fairtrade_core::{
    decode, peek_kind, Bulletin, BuyerSession, Claim, CryptoContext, MessageKind,
    NegoRequest, NegoResponse, ProtocolConfig, PublishedDataset, Range, Receipt, Request,
    Response, Secret, SellerSession,
};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

/// Fairtrade Party - file-based fair data trading
#[derive(Parser)]
#[command(name = "fairtrade-party")]
#[command(about = "Fair data trading over batch oblivious transfer")]
#[command(version)]
struct Cli {
    /// Protocol configuration (JSON); defaults apply when omitted
    #[arg(short, long, env = "FAIRTRADE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Commit to a raw item file and write a published dataset directory
    Publish {
        /// Raw file of fixed-size items
        #[arg(short, long)]
        items: PathBuf,

        /// Size of one item in bytes
        #[arg(short = 's', long)]
        item_size: usize,

        /// Published dataset directory
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Run a full trade between a local seller and buyer
    Trade {
        /// Published dataset directory
        #[arg(short, long, conflicts_with = "items")]
        dataset: Option<PathBuf>,

        /// Raw item file, published on the fly
        #[arg(short, long, requires = "item_size")]
        items: Option<PathBuf>,

        /// Item size for --items
        #[arg(short = 's', long)]
        item_size: Option<usize>,

        /// Demand ranges as start:count, comma-separated
        #[arg(long, value_delimiter = ',', required = true)]
        demand: Vec<Range>,

        /// Phantom ranges as start:count, comma-separated
        #[arg(long, value_delimiter = ',')]
        phantom: Vec<Range>,

        /// Seller name, hashed into the seller id
        #[arg(long, env = "SELLER_NAME", default_value = "seller")]
        seller: String,

        /// Buyer name, hashed into the buyer id
        #[arg(long, env = "BUYER_NAME", default_value = "buyer")]
        buyer: String,

        /// Directory receiving every message blob and the output
        #[arg(short, long, env = "DEST", default_value = "./trade")]
        out: PathBuf,
    },

    /// Verify a claim against a bulletin
    VerifyClaim {
        /// Claim blob
        #[arg(long)]
        claim: PathBuf,

        /// Bulletin JSON
        #[arg(long)]
        bulletin: PathBuf,
    },

    /// Print a summary of a message blob
    Inspect {
        /// Message blob
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ProtocolConfig::from_json_file(path)?,
        None => ProtocolConfig::default(),
    };
    let ctx = CryptoContext::new(config)?;

    match cli.command {
        Commands::Publish {
            ref items,
            item_size,
            ref out,
        } => {
            run_publish(&ctx, items, item_size, out)?;
        }
        Commands::Trade {
            ref dataset,
            ref items,
            item_size,
            ref demand,
            ref phantom,
            ref seller,
            ref buyer,
            ref out,
        } => {
            let dataset = load_dataset(&ctx, dataset.as_deref(), items.as_deref(), item_size)?;
            run_trade(
                &ctx,
                Arc::new(dataset),
                demand.clone(),
                phantom.clone(),
                party_id(seller),
                party_id(buyer),
                out,
            )?;
        }
        Commands::VerifyClaim {
            ref claim,
            ref bulletin,
        } => {
            run_verify_claim(&ctx, claim, bulletin)?;
        }
        Commands::Inspect { ref file } => {
            inspect(file)?;
        }
    }

    Ok(())
}

fn party_id(name: &str) -> [u8; 32] {
    Sha256::digest(name.as_bytes()).into()
}

fn run_publish(ctx: &CryptoContext, items: &Path, item_size: usize, out: &Path) -> Result<()> {
    let data = std::fs::read(items).with_context(|| format!("reading {}", items.display()))?;
    let dataset = PublishedDataset::from_items(ctx, item_size, data)?;
    dataset.save(out)?;

    let bulletin = dataset.bulletin();
    info!(
        items = bulletin.item_count,
        root = hex::encode(bulletin.root),
        path = ?out,
        "Dataset published"
    );
    println!("Bulletin root: {}", hex::encode(bulletin.root));
    println!("Seller key: {}", hex::encode(&bulletin.seller_key));

    Ok(())
}

fn load_dataset(
    ctx: &CryptoContext,
    dir: Option<&Path>,
    items: Option<&Path>,
    item_size: Option<usize>,
) -> Result<PublishedDataset> {
    match (dir, items, item_size) {
        (Some(dir), _, _) => Ok(PublishedDataset::open(ctx, dir)?),
        (None, Some(items), Some(item_size)) => {
            let data =
                std::fs::read(items).with_context(|| format!("reading {}", items.display()))?;
            Ok(PublishedDataset::from_items(ctx, item_size, data)?)
        }
        _ => bail!("either --dataset or --items with --item-size is required"),
    }
}

/// Send a message through the file transport: write it, read it back
fn exchange<T>(out: &Path, name: &str, message: &T) -> Result<T>
where
    T: fairtrade_core::WireMessage,
{
    let path = out.join(name);
    write_message(&path, message)?;
    Ok(read_message(&path)?)
}

fn run_trade(
    ctx: &CryptoContext,
    dataset: Arc<PublishedDataset>,
    demand: Vec<Range>,
    phantom: Vec<Range>,
    seller_id: [u8; 32],
    buyer_id: [u8; 32],
    out: &Path,
) -> Result<()> {
    std::fs::create_dir_all(out)?;
    dataset.bulletin().save(out.join(BULLETIN_FILE))?;
    dataset.public_params().save(out.join(PUBLIC_FILE))?;

    info!(
        seller = hex::encode(seller_id),
        buyer = hex::encode(buyer_id),
        items = dataset.len(),
        "Starting trade"
    );

    let mut seller = SellerSession::new(ctx, Arc::clone(&dataset), seller_id, buyer_id)?;
    let mut buyer = BuyerSession::open(
        ctx,
        out.join(BULLETIN_FILE),
        out.join(PUBLIC_FILE),
        seller_id,
        buyer_id,
        demand,
        phantom,
    )?;

    // Negotiation, buyer-initiated direction first
    let request: NegoRequest = exchange(out, "buyer_nego_request", &buyer.get_nego_request()?)?;
    let response: NegoResponse =
        exchange(out, "seller_nego_response", &seller.on_nego_request(&request)?)?;
    buyer.on_nego_response(&response)?;

    let request: NegoRequest = exchange(out, "seller_nego_request", &seller.get_nego_request()?)?;
    let response: NegoResponse =
        exchange(out, "buyer_nego_response", &buyer.on_nego_request(&request)?)?;
    seller.on_nego_response(&response)?;

    // Transfer
    let request: Request = exchange(out, "request", &buyer.get_request()?)?;
    let response: Response = exchange(out, "response", &seller.on_request(&request)?)?;
    let receipt: Receipt = exchange(out, "receipt", &buyer.on_response(&response)?)?;
    let secret: Secret = exchange(out, "secret", &seller.on_receipt(&receipt)?)?;

    match buyer.on_secret(&secret) {
        Ok(()) => {
            let output = out.join("output");
            buyer.decrypt_to(&output)?;
            info!(path = ?output, "Trade completed");
            println!(
                "Trade completed: {} items written to {}",
                buyer.demand_len(),
                output.display()
            );
        }
        Err(e) if e.is_claimable() => {
            warn!(error = %e, "Secret failed verification");
            let claim = buyer.generate_claim()?;
            let path = out.join("claim");
            write_message(&path, &claim)?;
            println!("Secret failed verification; claim written to {}", path.display());
        }
        Err(e) => return Err(e.into()),
    }

    seller.release();
    buyer.release();
    Ok(())
}

fn run_verify_claim(ctx: &CryptoContext, claim: &Path, bulletin: &Path) -> Result<()> {
    let claim: Claim = read_message(claim)?;
    let bulletin = Bulletin::load(bulletin)?;

    let verdict = claim.verify(ctx, &bulletin);
    info!(verdict = %verdict, "Claim verified");
    println!("Claim {}", verdict);

    if !verdict.is_upheld() {
        bail!("claim rejected");
    }
    Ok(())
}

fn inspect(file: &Path) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let kind = peek_kind(&bytes)?;
    println!("Kind: {:?} ({} bytes)", kind, bytes.len());

    match kind {
        MessageKind::NegoRequest => {
            let m: NegoRequest = decode(&bytes)?;
            println!("  From: {}", hex::encode(m.from));
            println!("  To: {}", hex::encode(m.to));
            println!("  Role: {:?}", m.role);
            println!("  Carries base OT: {}", !m.base_ot.is_empty());
        }
        MessageKind::NegoResponse => {
            let m: NegoResponse = decode(&bytes)?;
            println!("  From: {}", hex::encode(m.from));
            println!("  To: {}", hex::encode(m.to));
            println!("  Role: {:?}", m.role);
            println!("  Request: {}", hex::encode(m.request_digest));
            println!("  Base OT points: {}", m.base_ot.len());
        }
        MessageKind::Request => {
            let m: Request = decode(&bytes)?;
            let ranges: Vec<String> = m.ranges.iter().map(Range::to_string).collect();
            println!("  Ranges: {}", ranges.join(","));
            println!("  Queries: {}", m.query_count);
            println!("  OT columns: {}", m.ot_columns.len());
        }
        MessageKind::Response => {
            let m: Response = decode(&bytes)?;
            println!("  Request: {}", hex::encode(m.request_digest));
            println!("  Bulletin root: {}", hex::encode(m.bulletin_root));
            println!("  Key commitment: {}", hex::encode(&m.key_commitment));
            println!("  Blocks: {}", m.blocks.len());
            println!("  Masked wrap keys: {}", m.masked_wraps.len());
        }
        MessageKind::Receipt => {
            let m: Receipt = decode(&bytes)?;
            println!("  Response: {}", hex::encode(m.body.response_digest));
            println!("  Block root: {}", hex::encode(m.body.block_root));
            println!("  Blocks: {}", m.body.block_count);
            println!("  Buyer key: {}", hex::encode(&m.body.buyer_key));
        }
        MessageKind::Secret => {
            let m: Secret = decode(&bytes)?;
            println!("  Receipt: {}", hex::encode(m.receipt_digest));
        }
        MessageKind::Claim => {
            let m: Claim = decode(&bytes)?;
            println!("  Receipt block root: {}", hex::encode(m.receipt.body.block_root));
            match &m.evidence {
                Some(e) => println!("  Disputed item: {} (block {})", e.item_index, e.position),
                None => println!("  Disputed: key commitment"),
            }
        }
    }

    Ok(())
}
