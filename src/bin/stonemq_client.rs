// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use stonemq_client::{
    setup_tracing, AppError, AppResult, ClientConfig, Consumer, MemoryBroker, Producer, Record,
    ResetPolicy, Session,
};
use tokio::runtime;
use tracing::info;

#[derive(Parser)]
#[command(version, about = "Producer and consumer demo against an in-process broker")]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for the rolling log file
    #[arg(long, default_value = "./logs")]
    pub log_dir: String,
    #[command(subcommand)]
    pub command: Command,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// send keyed records and print their delivery results
    Produce {
        #[arg(short, long, default_value = "orders")]
        topic: String,
        #[arg(short = 'n', long, default_value_t = 5)]
        count: u32,
        #[arg(short, long, default_value_t = 3)]
        partitions: i32,
    },
    /// seed a topic, then poll it as a group member
    Consume {
        #[arg(short, long, default_value = "orders")]
        topic: String,
        #[arg(short, long, default_value_t = 2)]
        partitions: i32,
        /// records written before consuming
        #[arg(long, default_value_t = 10)]
        seed: u32,
        #[arg(long, default_value_t = 5)]
        rounds: u32,
        #[arg(long, default_value_t = 200)]
        poll_ms: u64,
        #[arg(long)]
        reset_policy: Option<ResetPolicy>,
    },
    PrintConfig,
}

fn load_config(conf: Option<&str>) -> AppResult<ClientConfig> {
    match conf {
        Some(path) => ClientConfig::set_up_config(PathBuf::from(path)),
        None => {
            let path = PathBuf::from("./conf.toml");
            if path.exists() {
                ClientConfig::set_up_config(path)
            } else {
                Ok(ClientConfig::default())
            }
        }
    }
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn main() -> AppResult<()> {
    let commandline = CommandLine::parse();
    let _guard = setup_tracing(&commandline.log_dir, log_level(commandline.verbose))?;
    let config = load_config(commandline.conf.as_deref())?;

    let rt = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| AppError::IllegalStateError(format!("cannot start runtime: {}", e)))?;

    match commandline.command {
        Command::PrintConfig => {
            println!("{:#?}", config);
            Ok(())
        }
        Command::Produce {
            topic,
            count,
            partitions,
        } => rt.block_on(produce(config, topic, count, partitions)),
        Command::Consume {
            topic,
            partitions,
            seed,
            rounds,
            poll_ms,
            reset_policy,
        } => rt.block_on(consume(
            config,
            topic,
            partitions,
            seed,
            rounds,
            Duration::from_millis(poll_ms),
            reset_policy,
        )),
    }
}

fn start_broker(config: &ClientConfig, topic: &str, partitions: i32) -> AppResult<MemoryBroker> {
    let broker = MemoryBroker::with_addresses(config.session.bootstrap_servers.clone());
    broker.create_topic(topic, partitions)?;
    info!("in-process broker listening on {:?}", broker.addresses());
    Ok(broker)
}

async fn send_keyed(producer: &Producer, topic: &str, count: u32) -> AppResult<()> {
    let mut pending = Vec::with_capacity(count as usize);
    for i in 1..=count {
        let record = Record::new(topic, format!("order #{}", i)).with_key(i.to_string());
        pending.push((i, producer.send(record).await?));
    }
    producer.flush().await?;
    for (key, delivery) in pending {
        let result = delivery.await;
        match &result.result {
            Ok(offset) => println!(
                "key={} -> {} offset {}",
                key, result.topic_partition, offset
            ),
            Err(e) => println!("key={} -> {} failed: {}", key, result.topic_partition, e),
        }
    }
    Ok(())
}

async fn produce(config: ClientConfig, topic: String, count: u32, partitions: i32) -> AppResult<()> {
    let broker = start_broker(&config, &topic, partitions)?;
    let session = Session::connect(&config.session, broker.transport())?;
    let producer = Producer::new(&config.producer, session.clone())?;

    let sent = send_keyed(&producer, &topic, count).await;
    producer.close().await;
    session.close().await;
    sent
}

async fn consume(
    config: ClientConfig,
    topic: String,
    partitions: i32,
    seed: u32,
    rounds: u32,
    poll_timeout: Duration,
    reset_policy: Option<ResetPolicy>,
) -> AppResult<()> {
    let broker = start_broker(&config, &topic, partitions)?;
    let session = Session::connect(&config.session, broker.transport())?;

    let producer = Producer::new(&config.producer, session.clone())?;
    send_keyed(&producer, &topic, seed).await?;
    producer.close().await;

    let mut consumer_config = config.consumer.clone();
    if consumer_config.group_id.is_empty() {
        consumer_config.group_id = "demo-group".to_string();
    }
    let consumer = Consumer::new(&consumer_config, session.clone())?;
    consumer
        .subscribe(
            &[topic.as_str()],
            reset_policy.unwrap_or(ResetPolicy::Earliest),
        )
        .await?;
    println!("assigned: {:?}", consumer.assignment());

    let mut outcome = Ok(());
    for round in 1..=rounds {
        let result = match consumer.poll(poll_timeout).await {
            Ok(result) => result,
            Err(e) => {
                outcome = Err(e);
                break;
            }
        };
        for record in result.records() {
            println!(
                "round {} {}-{}@{} key={} value={}",
                round,
                record.topic,
                record.partition,
                record.offset,
                record.key_str().unwrap_or("-"),
                record.value_str().unwrap_or("<binary>")
            );
        }
        if let Some(event) = result.rebalance {
            println!("rebalance: {:?}", event);
        }
        if let Err(e) = consumer.commit_consumed().await {
            outcome = Err(e);
            break;
        }
    }

    consumer.close().await;
    session.close().await;
    outcome
}
