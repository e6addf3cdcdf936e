use clap::Parser;
use reqwest::Client;
use std::time::{Duration, Instant};
use traffic_lens::api::{HistoryResponse, StatusResponse};

/// Polls a running Traffic Lens dashboard and summarizes what it saw
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Origin of the dashboard
    #[clap(short, long, default_value = "http://127.0.0.1:32170")]
    origin: String,

    /// Number of polls to make
    #[clap(short, long, default_value_t = 1)]
    number_of_requests: u32,

    /// Interval in milliseconds between polls
    #[clap(long, default_value_t = 1000)]
    interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut futures = Vec::with_capacity(args.number_of_requests as usize);

    let start_time = Instant::now();
    for i in 0..args.number_of_requests {
        futures.push(tokio::task::spawn(poll_status(args.origin.clone())));
        if i + 1 < args.number_of_requests {
            tokio::time::sleep(Duration::from_millis(args.interval)).await;
        }
    }
    let results = futures::future::join_all(futures).await;
    let runtime_duration = start_time.elapsed();

    let mut request_times: Vec<Duration> = Vec::with_capacity(results.len());
    let mut rate_limited_polls = 0;
    let mut last_status = None;
    for result in results {
        match result {
            Ok(Ok((status, request_time))) => {
                if status.schedule.is_rate_limited {
                    rate_limited_polls += 1;
                }
                request_times.push(request_time);
                last_status = Some(status);
            }
            Ok(Err(e)) => eprintln!("Poll failed: {e}"),
            Err(e) => eprintln!("Poll task failed: {e}"),
        }
    }

    if let Some(status) = last_status {
        println!("{:#?}", status);
    }
    let history = fetch_history(&args.origin).await?;
    println!(
        "History: {} entries, average {:.1} vehicles, peak {}, latest congestion {:?}",
        history.stats.samples,
        history.stats.average_vehicles,
        history.stats.peak_vehicles,
        history.stats.latest_congestion
    );

    println!(
        "Polling {}, {} times with {} ms interval",
        args.origin, args.number_of_requests, args.interval
    );
    println!("Runtime duration: {:?}", runtime_duration);
    println!("Rate limited in {} of {} polls", rate_limited_polls, request_times.len());
    match (request_times.iter().min(), request_times.iter().max()) {
        (Some(min_duration), Some(max_duration)) => {
            let avg_duration = request_times.iter().sum::<Duration>() / request_times.len() as u32;
            println!("Minimum request time: {:?}", min_duration);
            println!("Maximum request time: {:?}", max_duration);
            println!("Average request time: {:?}", avg_duration);
        }
        _ => println!("No request times to summarize"),
    }

    Ok(())
}

async fn poll_status(origin: String) -> anyhow::Result<(StatusResponse, Duration)> {
    let url = reqwest::Url::parse(&origin)?.join("v1/status")?;
    let client = Client::new();

    let request_start_time = Instant::now();
    let response = client.get(url).send().await?.error_for_status()?;
    let response = response.json::<StatusResponse>().await?;

    Ok((response, request_start_time.elapsed()))
}

async fn fetch_history(origin: &str) -> anyhow::Result<HistoryResponse> {
    let url = reqwest::Url::parse(origin)?.join("v1/history")?;
    let response = Client::new().get(url).send().await?.error_for_status()?;
    Ok(response.json::<HistoryResponse>().await?)
}
