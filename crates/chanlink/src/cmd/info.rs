use std::time::Instant;

use chanlink::peer::RemoteChannel;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use crate::cmd::{parse_duration, socket_address, InfoArgs, Session, Settings};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::OutputFormat;

#[derive(Serialize)]
struct ChannelInfo {
    remote_id: u32,
    type_name: String,
    bound: bool,
}

#[derive(Serialize)]
struct InfoOutput {
    peer: String,
    state: String,
    activation_ms: f64,
    channels: Vec<ChannelInfo>,
}

pub fn run(args: InfoArgs, format: OutputFormat, settings: &Settings) -> CliResult<i32> {
    let address = socket_address(&args.path)?;
    let settle = parse_duration(&args.settle)?;
    let session = Session::start(settings)?;

    let connection = session
        .context()
        .create_connection(address)
        .map_err(|err| peer_error("connect failed", err))?;
    session.wait_for_activation(&connection)?;
    let activation_ms = (connection.age().as_secs_f64() * 1000.0 * 100.0).round() / 100.0;

    let settled = Instant::now();
    while settled.elapsed() < settle {
        session.tick();
    }

    let out = InfoOutput {
        peer: connection.peer().to_string(),
        state: connection.state().to_string(),
        activation_ms,
        channels: connection.remote_channels().into_iter().map(channel_info).collect(),
    };
    print_info(&out, format);
    Ok(SUCCESS)
}

fn channel_info(remote: RemoteChannel) -> ChannelInfo {
    ChannelInfo {
        remote_id: remote.remote_id,
        type_name: remote.type_name,
        bound: remote.bound,
    }
}

fn print_info(out: &InfoOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["REMOTE ID", "TYPE", "BOUND"]);
            for channel in &out.channels {
                table.add_row(vec![
                    channel.remote_id.to_string(),
                    channel.type_name.clone(),
                    channel.bound.to_string(),
                ]);
            }
            println!(
                "peer={} state={} activation_ms={}",
                out.peer, out.state, out.activation_ms
            );
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "peer={} state={} activation_ms={}",
                out.peer, out.state, out.activation_ms
            );
            for channel in &out.channels {
                println!(
                    "  channel remote_id={} type={} bound={}",
                    channel.remote_id, channel.type_name, channel.bound
                );
            }
        }
        OutputFormat::Raw => {
            for channel in &out.channels {
                println!("{}\t{}", channel.remote_id, channel.type_name);
            }
        }
    }
}
