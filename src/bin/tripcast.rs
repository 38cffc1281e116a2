use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as Frame;
use tripcast::model::TripId;
use tripcast::{Message, MessageType, TripSnapshot};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("tripcast")
        .version("0.1.0")
        .about("🚌 Watch live bus trip progress")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("Server host")
                .takes_value(true)
                .default_value("127.0.0.1")
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Server port")
                .takes_value(true)
                .default_value("8080")
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "json", "compact"])
                .default_value("table")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("watch")
                .about("📡 Stream every trip event the server publishes")
                .arg(
                    Arg::with_name("count")
                        .short("n")
                        .long("count")
                        .value_name("EVENTS")
                        .help("Exit after this many trip events")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("trip")
                .about("🔎 Show one trip, then follow its events until it finishes")
                .arg(
                    Arg::with_name("id")
                        .help("Trip id")
                        .required(true)
                        .validator(|v| v.parse::<u64>().map(|_| ()).map_err(|_| "Trip id must be a number".into())),
                )
                .arg(
                    Arg::with_name("once")
                        .long("once")
                        .help("Print the current snapshot and exit"),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or("127.0.0.1");
    let port = matches.value_of("port").unwrap_or("8080").parse::<u16>()?;
    let format = Format::from(matches.value_of("format").unwrap_or("table"));
    let url = format!("ws://{}:{}/", host, port);

    match matches.subcommand() {
        ("watch", Some(sub)) => handle_watch(&url, sub, format).await?,
        ("trip", Some(sub)) => handle_trip(&url, sub, format).await?,
        _ => println!("{}", "No command specified. Use --help for usage information.".yellow()),
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Format {
    Table,
    Json,
    Compact,
}

impl From<&str> for Format {
    fn from(value: &str) -> Self {
        match value {
            "json" => Format::Json,
            "compact" => Format::Compact,
            _ => Format::Table,
        }
    }
}

/// What to do with the stream after one event.
enum Follow {
    Continue,
    Stop,
}

async fn handle_watch(url: &str, matches: &ArgMatches<'_>, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let limit = matches.value_of("count").map(str::parse::<usize>).transpose()?;
    let mut seen = 0usize;
    if format == Format::Table {
        print_table_header();
    }
    stream_events(url, None, format, |message| {
        if message.trip_id().is_some() {
            seen += 1;
        }
        match limit {
            Some(limit) if seen >= limit => Follow::Stop,
            _ => Follow::Continue,
        }
    })
    .await
}

async fn handle_trip(url: &str, matches: &ArgMatches<'_>, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let trip_id = matches.value_of("id").unwrap_or_default().parse::<TripId>()?;
    let once = matches.is_present("once");
    if format == Format::Table {
        print_table_header();
    }
    stream_events(url, Some(trip_id), format, |message| match message.kind() {
        MessageType::TripUpdate if once => Follow::Stop,
        MessageType::TripUpdate => match message.snapshot() {
            Ok(snapshot) if snapshot.trip.status.is_terminal() => Follow::Stop,
            _ => Follow::Continue,
        },
        MessageType::TripCompleted | MessageType::TripCancelled => Follow::Stop,
        _ => Follow::Continue,
    })
    .await
}

/// Connect, optionally subscribe to one trip, and print events until the
/// server closes the connection or `on_event` says stop. With a trip id set,
/// events for other trips are skipped.
async fn stream_events<F>(
    url: &str,
    trip_id: Option<TripId>,
    format: Format,
    mut on_event: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: FnMut(&Message) -> Follow,
{
    let (ws, _) = match connect_async(url).await {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("{} Failed to connect to trip server at {}", "❌".red(), url.bright_white());
            eprintln!("{} Start it with:", "💡".yellow());
            eprintln!("   {}", "cargo run --bin tripcast-server -- --demo".bright_cyan());
            return Err(e.into());
        }
    };
    let (mut sink, mut stream) = ws.split();

    if let Some(id) = trip_id {
        sink.send(Frame::text(Message::subscribe_trip(id).to_json()?)).await?;
    }

    while let Some(frame) = stream.next().await {
        let text = match frame? {
            Frame::Text(text) => text.as_str().to_owned(),
            Frame::Close(_) => break,
            _ => continue,
        };
        let message: Message = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(e) => {
                eprintln!("{} Unreadable message: {}", "⚠️".yellow(), e);
                continue;
            }
        };
        if let (Some(wanted), Some(got)) = (trip_id, message.trip_id()) {
            if wanted != got {
                continue;
            }
        }

        match format {
            Format::Json => println!("{}", text),
            Format::Compact => print_compact(&message),
            Format::Table => print_table_row(&message),
        }

        if let Follow::Stop = on_event(&message) {
            break;
        }
    }

    let _ = sink.send(Frame::Close(None)).await;
    Ok(())
}

fn print_table_header() {
    println!("{}", "┌────────────────┬──────┬─────┬───────────┬──────────┬─────────────────────────┬─────────────────────┐".bright_white());
    println!("{}", "│ Event          │ Trip │ Bus │ Status    │ Progress │ Position                │ Route               │".bright_white());
    println!("{}", "├────────────────┼──────┼─────┼───────────┼──────────┼─────────────────────────┼─────────────────────┤".bright_white());
}

fn print_table_row(message: &Message) {
    if message.kind() == MessageType::Welcome {
        let text = message.data().as_str().unwrap_or_default();
        println!("{} {}", "🔗".green(), text.bright_green());
        return;
    }
    let snapshot = match message.snapshot() {
        Ok(snapshot) => snapshot,
        Err(_) => return,
    };
    let trip = &snapshot.trip;
    let event = format!("{:<14}", message.kind().as_str());
    let event = match message.kind() {
        MessageType::TripStarted => event.bright_cyan(),
        MessageType::TripCompleted => event.bright_green(),
        MessageType::TripCancelled => event.bright_red(),
        _ => event.white(),
    };
    let status = format!("{:<9}", trip.status.to_string());
    let status = if trip.error.is_some() { status.red() } else { status.normal() };
    println!(
        "│ {} │ {:>4} │ {:>3} │ {} │ {:>7.1}% │ {:>10.5}, {:>11.5} │ {:<19} │",
        event,
        trip.id,
        trip.bus_id,
        status,
        trip.progress,
        trip.current_lat,
        trip.current_lng,
        truncate(&snapshot.route.name, 19),
    );
    if let Some(error) = &trip.error {
        println!("│ {} {}", "⚠️".yellow(), error.bright_red());
    }
}

fn print_compact(message: &Message) {
    match message.snapshot() {
        Ok(TripSnapshot { trip, bus, .. }) if message.kind() != MessageType::Welcome => {
            println!(
                "{} trip={} bus={} status={} progress={:.0}% fuel={:.1}",
                message.kind(),
                trip.id,
                trip.bus_id,
                trip.status,
                trip.progress,
                bus.current_fuel
            );
        }
        _ => println!("{}", message.kind()),
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(width.saturating_sub(1)).collect();
        cut.push('…');
        cut
    }
}
