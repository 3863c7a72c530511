//! Offline renderer for binary flow dumps.
//!
//! Reads `<file>.bin` as produced by `dump-flows --binary`, applies an
//! all-AND filter, and writes the textual rendering to `<file>`. The dump
//! is consumed on the same architecture that produced it.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::process::exit;

use clap::Parser;

use flowgate::common::enums::PktType;
use flowgate::dump::{DumpFilter, FilterSpec, FlowDescriptor, DESCRIPTOR_BYTES};
use flowgate::utils::logger;

#[derive(Parser)]
#[clap(name = "show-flows", disable_version_flag = true)]
struct Args {
    /// binary dump file, without the .bin suffix
    #[clap(short, long)]
    file: Option<String>,
    /// source ip, optionally with /cidr or /netmask
    #[clap(short = 'r', long)]
    srcip: Option<String>,
    /// destination ip, optionally with /cidr or /netmask
    #[clap(short = 't', long)]
    dstip: Option<String>,
    /// source port
    #[clap(short = 's', long)]
    srcport: Option<u16>,
    /// destination port
    #[clap(short = 'd', long)]
    dstport: Option<u16>,
    /// one of IP, TCP, UDP, ICMP
    #[clap(short = 'p', long)]
    protocol: Option<String>,
    /// print the version
    #[clap(short = 'v', long)]
    version: bool,
}

fn build_filter(args: &Args) -> Result<DumpFilter, String> {
    let mut spec = FilterSpec::default();
    if let Some(srcip) = &args.srcip {
        spec.set_src_ip(srcip)
            .map_err(|e| format!("inet_pton on src ip failed: {}", e))?;
    }
    if let Some(dstip) = &args.dstip {
        spec.set_dst_ip(dstip)
            .map_err(|e| format!("inet_pton on dest ip failed: {}", e))?;
    }
    if let Some(port) = args.srcport {
        spec.set_src_port(port);
    }
    if let Some(port) = args.dstport {
        spec.set_dst_port(port);
    }
    if let Some(protocol) = &args.protocol {
        if !protocol.is_empty() {
            let proto: PktType = protocol
                .parse()
                .map_err(|_| "Invalid Protocol; valid protocols are IP/TCP/UDP/ICMP".to_string())?;
            spec.set_proto(proto);
        }
    }
    Ok(DumpFilter::AllAnd(spec))
}

fn main() {
    let args = Args::parse();
    let _logger = logger::init_stderr(log::Level::Warn);

    if args.version {
        println!("show-flows - version {}", env!("CARGO_PKG_VERSION"));
        exit(0);
    }

    let Some(ref file_name) = args.file else {
        eprintln!("Input file name must be specified");
        exit(1);
    };

    let filter = match build_filter(&args) {
        Ok(filter) => filter,
        Err(msg) => {
            eprintln!("{}", msg);
            exit(1);
        }
    };

    let binary_file_name = format!("{}.bin", file_name);
    let bin_file = match File::open(&binary_file_name) {
        Ok(file) => file,
        Err(_) => {
            eprintln!("show-flows failed to open binary file: {}", binary_file_name);
            exit(1);
        }
    };

    let text_file = match File::create(&file_name) {
        Ok(file) => file,
        Err(_) => {
            eprintln!("show-flows failed to open text file: {}", file_name);
            exit(1);
        }
    };

    let mut bin_stream = BufReader::new(bin_file);
    let mut text_stream = BufWriter::new(text_file);
    let match_all = filter.is_match_all();

    let mut record = [0u8; DESCRIPTOR_BYTES];
    loop {
        match bin_stream.read_exact(&mut record) {
            Ok(()) => {}
            Err(_) => break, // end of dump, possibly with a truncated tail
        }
        let Some(descriptor) = FlowDescriptor::decode(&record) else {
            break;
        };
        let keep = match_all
            || match PktType::try_from(descriptor.pkt_type) {
                Ok(pkt_type) => filter.matches(
                    &descriptor.src_ip,
                    &descriptor.dst_ip,
                    descriptor.src_port,
                    descriptor.dst_port,
                    pkt_type,
                ),
                Err(_) => false,
            };
        if keep {
            if descriptor.print(&mut text_stream).is_err() {
                eprintln!("show-flows failed writing text file: {}", file_name);
                exit(1);
            }
        }
    }

    if text_stream.flush().is_err() {
        eprintln!("show-flows failed writing text file: {}", file_name);
        exit(1);
    }

    exit(0);
}
