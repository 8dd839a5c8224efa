use anyhow::{anyhow, bail, Context};
use avahi_async::config::{self, Config};
use avahi_async::types::{dns_class, dns_type, txt_from_pairs};
use avahi_async::{
    Client, EntryGroup, EntryGroupState, Event, LookupFlags, Protocol, PublishFlags, RecordBrowser,
    RecordItem, ResolvedService, ServiceBrowser, ServiceItem, ServiceResolver, IF_UNSPEC,
    PROTO_INET, PROTO_INET6, PROTO_UNSPEC,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "avahi-async")]
#[command(author, version, about = "Browse, resolve and publish services through avahi-daemon", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Seconds to wait for the daemon to show up on the bus
    #[arg(long, global = true, default_value_t = 5)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the daemon state
    State,

    /// Print or change the host name
    Hostname {
        /// New host name
        #[arg(long)]
        set: Option<String>,
    },

    /// Browse services of a type (e.g., "_http._tcp")
    Browse {
        service_type: String,

        /// Domain to browse (default: the daemon's default domain)
        #[arg(short, long, default_value = "")]
        domain: String,

        /// Resolve every service found
        #[arg(short, long)]
        resolve: bool,

        /// Stop after the initial results instead of waiting for Ctrl+C
        #[arg(long)]
        once: bool,
    },

    /// Browse raw DNS records
    Records {
        /// Record name (e.g., "myhost.local")
        name: String,

        /// Record type (A, AAAA, PTR, SRV, TXT, ...)
        #[arg(short = 't', long = "type", default_value = "A")]
        record_type: String,

        /// Record class
        #[arg(long, default_value_t = dns_class::IN)]
        class: u16,

        /// Keep running after the initial results
        #[arg(long)]
        follow: bool,
    },

    /// Resolve one service instance
    Resolve {
        name: String,
        service_type: String,

        #[arg(short, long, default_value = "")]
        domain: String,
    },

    /// Ask the daemon to re-check cached records
    Reconfirm {
        /// Record name (e.g., "_http._tcp.local")
        name: String,

        /// Record type
        #[arg(short = 't', long = "type", default_value = "PTR")]
        record_type: String,
    },

    /// Publish a service until Ctrl+C
    Publish {
        name: String,
        service_type: String,
        port: u16,

        #[arg(short, long, default_value = "")]
        domain: String,

        /// TXT entry as key=value (repeatable)
        #[arg(long = "txt")]
        txt: Vec<String>,

        /// Subtype, e.g. "_printer._sub._http._tcp" (repeatable)
        #[arg(long)]
        subtype: Vec<String>,
    },

    /// Configure settings
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

/// Signals forwarded from proxy events to the command loop.
enum Update {
    ServiceNew(ServiceItem),
    ServiceRemove(ServiceItem),
    RecordNew(RecordItem),
    RecordRemove(RecordItem),
    Resolver(Arc<ServiceResolver>),
    Resolved(ResolvedService),
    GroupState(EntryGroupState, String),
    AllForNow,
    Failure(String),
    ErrorLog(String),
}

type Updates = mpsc::UnboundedSender<Update>;

fn init_logging(verbose: bool, level: &str) {
    let filter = if verbose {
        EnvFilter::new("avahi_async=debug,zbus=info")
    } else {
        EnvFilter::new(format!("avahi_async={},zbus=warn", level.to_lowercase()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { show } = &cli.command {
        init_logging(cli.verbose, "warn");
        if *show {
            config::show(cli.config.as_deref())?;
        } else {
            println!("Use --show to display the configuration");
        }
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    init_logging(cli.verbose, &config.logging.level);

    let client = connect(&config, Duration::from_secs(cli.timeout)).await?;

    match cli.command {
        Commands::State => {
            let (done, reply) = completion();
            client.get_server_state(done);
            println!("{}", outcome(reply).await?);
        }

        Commands::Hostname { set } => match set {
            Some(name) => {
                let (done, reply) = completion();
                client.set_host_name(&name, done);
                outcome(reply).await?;
                info!("Host name set to {}", name);
            }
            None => {
                let (done, reply) = completion();
                client.get_host_name(done);
                println!("{}", outcome(reply).await?);
            }
        },

        Commands::Browse {
            service_type,
            domain,
            resolve,
            once,
        } => browse(&client, &service_type, &domain, resolve, once).await?,

        Commands::Records {
            name,
            record_type,
            class,
            follow,
        } => {
            let record_type = parse_record_type(&record_type)?;
            records(&client, &name, class, record_type, follow).await?
        }

        Commands::Resolve {
            name,
            service_type,
            domain,
        } => resolve(&client, &name, &service_type, &domain).await?,

        Commands::Reconfirm { name, record_type } => {
            let record_type = parse_record_type(&record_type)?;
            reconfirm(&client, &name, record_type).await?
        }

        Commands::Publish {
            name,
            service_type,
            port,
            domain,
            txt,
            subtype,
        } => publish(&client, &name, &service_type, &domain, port, &txt, &subtype).await?,

        Commands::Config { .. } => {}
    }

    Ok(())
}

async fn connect(config: &Config, timeout: Duration) -> anyhow::Result<Client> {
    let client = Client::connect(&config.bus)
        .await
        .with_context(|| format!("Cannot connect to the {} bus", config.bus.kind))?;

    tokio::time::timeout(timeout, client.wait_connected())
        .await
        .map_err(|_| {
            anyhow!(
                "{} did not appear on the {} bus within {}s",
                config.bus.daemon_name,
                config.bus.kind,
                timeout.as_secs()
            )
        })?;

    debug!("Daemon is present");
    Ok(client)
}

type Completion<T> = Box<dyn FnOnce(avahi_async::Result<T>) + Send>;

/// A completion that forwards its result to the returned receiver.
fn completion<T: Send + 'static>() -> (Completion<T>, oneshot::Receiver<avahi_async::Result<T>>) {
    let (tx, rx) = oneshot::channel();
    let done: Completion<T> = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (done, rx)
}

async fn outcome<T>(reply: oneshot::Receiver<avahi_async::Result<T>>) -> anyhow::Result<T> {
    Ok(reply.await.context("Operation was abandoned")??)
}

fn parse_record_type(name: &str) -> anyhow::Result<u16> {
    dns_type::parse(name).ok_or_else(|| anyhow!("Unknown record type '{}'", name))
}

fn protocol_name(protocol: Protocol) -> &'static str {
    match protocol {
        PROTO_INET => "IPv4",
        PROTO_INET6 => "IPv6",
        _ => "any",
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|byte| format!("{:02x}", byte)).collect()
}

fn forward_service_browser(browser: &ServiceBrowser, updates: &Updates) {
    let tx = updates.clone();
    browser.item_new().connect(move |item| {
        let _ = tx.send(Update::ServiceNew(item.clone()));
    });
    let tx = updates.clone();
    browser.item_remove().connect(move |item| {
        let _ = tx.send(Update::ServiceRemove(item.clone()));
    });
    let tx = updates.clone();
    browser.all_for_now().connect(move |_| {
        let _ = tx.send(Update::AllForNow);
    });
    let tx = updates.clone();
    browser.failure().connect(move |error| {
        let _ = tx.send(Update::Failure(error.clone()));
    });
    forward_error_log(browser.error_log(), updates);
}

fn forward_record_browser(browser: &RecordBrowser, updates: &Updates) {
    let tx = updates.clone();
    browser.item_new().connect(move |item| {
        let _ = tx.send(Update::RecordNew(item.clone()));
    });
    let tx = updates.clone();
    browser.item_remove().connect(move |item| {
        let _ = tx.send(Update::RecordRemove(item.clone()));
    });
    let tx = updates.clone();
    browser.all_for_now().connect(move |_| {
        let _ = tx.send(Update::AllForNow);
    });
    let tx = updates.clone();
    browser.failure().connect(move |error| {
        let _ = tx.send(Update::Failure(error.clone()));
    });
    forward_error_log(browser.error_log(), updates);
}

fn forward_resolver(resolver: &ServiceResolver, updates: &Updates) {
    let tx = updates.clone();
    resolver.found().connect(move |service| {
        let _ = tx.send(Update::Resolved(service.clone()));
    });
    let tx = updates.clone();
    resolver.failure().connect(move |error| {
        let _ = tx.send(Update::Failure(error.clone()));
    });
    forward_error_log(resolver.error_log(), updates);
}

fn forward_error_log(log: &Event<String>, updates: &Updates) {
    let tx = updates.clone();
    log.connect(move |message| {
        let _ = tx.send(Update::ErrorLog(message.clone()));
    });
}

fn start_resolver(client: &Client, item: &ServiceItem, updates: &Updates) {
    let tx = updates.clone();
    client.create_service_resolver(
        item.interface,
        item.protocol,
        &item.name,
        &item.service_type,
        &item.domain,
        PROTO_UNSPEC,
        LookupFlags::empty(),
        move |result| match result {
            Ok(resolver) => {
                forward_resolver(&resolver, &tx);
                let _ = tx.send(Update::Resolver(resolver));
            }
            Err(e) => eprintln!("Cannot create service resolver: {}", e),
        },
    );
}

fn print_resolved(service: &ResolvedService) {
    println!(
        "= {} {} {} {} [{}]:{} host={}",
        protocol_name(service.protocol),
        service.name,
        service.service_type,
        service.domain,
        service.address,
        service.port,
        service.host
    );
    for entry in service.txt_strings() {
        println!("    {}", entry);
    }
}

async fn browse(
    client: &Client,
    service_type: &str,
    domain: &str,
    resolve: bool,
    once: bool,
) -> anyhow::Result<()> {
    let (updates, mut incoming) = mpsc::unbounded_channel();
    let (done, created) = oneshot::channel();

    let tx = updates.clone();
    client.create_service_browser(
        IF_UNSPEC,
        PROTO_UNSPEC,
        service_type,
        domain,
        LookupFlags::empty(),
        move |result: avahi_async::Result<Arc<ServiceBrowser>>| {
            if let Ok(browser) = &result {
                forward_service_browser(browser, &tx);
            }
            let _ = done.send(result);
        },
    );
    let browser = outcome(created)
        .await
        .context("Cannot create service browser")?;
    info!("Browsing {} via {}", service_type, browser.object_path());

    let mut resolvers = Vec::new();
    loop {
        let update = tokio::select! {
            update = incoming.recv() => update,
            _ = tokio::signal::ctrl_c() => break,
        };

        match update {
            Some(Update::ServiceNew(item)) => {
                println!(
                    "+ {} {} {} {} {}",
                    item.interface,
                    protocol_name(item.protocol),
                    item.name,
                    item.service_type,
                    item.domain
                );
                if resolve {
                    start_resolver(client, &item, &updates);
                }
            }
            Some(Update::ServiceRemove(item)) => println!(
                "- {} {} {} {} {}",
                item.interface,
                protocol_name(item.protocol),
                item.name,
                item.service_type,
                item.domain
            ),
            Some(Update::Resolver(resolver)) => resolvers.push(resolver),
            Some(Update::Resolved(service)) => print_resolved(&service),
            Some(Update::AllForNow) if once => break,
            Some(Update::Failure(error)) => bail!("Browsing failed: {}", error),
            Some(Update::ErrorLog(message)) => eprintln!("{}", message),
            Some(_) => {}
            None => break,
        }
    }

    Ok(())
}

async fn records(
    client: &Client,
    name: &str,
    class: u16,
    record_type: u16,
    follow: bool,
) -> anyhow::Result<()> {
    let (updates, mut incoming) = mpsc::unbounded_channel();
    let (done, created) = oneshot::channel();

    client.create_record_browser(
        IF_UNSPEC,
        PROTO_UNSPEC,
        name,
        class,
        record_type,
        LookupFlags::empty(),
        move |result: avahi_async::Result<Arc<RecordBrowser>>| {
            if let Ok(browser) = &result {
                forward_record_browser(browser, &updates);
            }
            let _ = done.send(result);
        },
    );
    let _browser = outcome(created)
        .await
        .context("Cannot create record browser")?;

    loop {
        let update = tokio::select! {
            update = incoming.recv() => update,
            _ = tokio::signal::ctrl_c() => break,
        };

        match update {
            Some(Update::RecordNew(item)) => println!(
                "+ {} {} {} class={} type={} {}",
                item.interface,
                protocol_name(item.protocol),
                item.name,
                item.class,
                item.record_type,
                hex(&item.data)
            ),
            Some(Update::RecordRemove(item)) => println!(
                "- {} {} {} class={} type={}",
                item.interface,
                protocol_name(item.protocol),
                item.name,
                item.class,
                item.record_type
            ),
            Some(Update::AllForNow) if !follow => break,
            Some(Update::Failure(error)) => bail!("Browsing failed: {}", error),
            Some(Update::ErrorLog(message)) => eprintln!("{}", message),
            Some(_) => {}
            None => break,
        }
    }

    Ok(())
}

async fn resolve(
    client: &Client,
    name: &str,
    service_type: &str,
    domain: &str,
) -> anyhow::Result<()> {
    let (updates, mut incoming) = mpsc::unbounded_channel();
    let (done, created) = oneshot::channel();

    client.create_service_resolver(
        IF_UNSPEC,
        PROTO_UNSPEC,
        name,
        service_type,
        domain,
        PROTO_UNSPEC,
        LookupFlags::empty(),
        move |result: avahi_async::Result<Arc<ServiceResolver>>| {
            if let Ok(resolver) = &result {
                forward_resolver(resolver, &updates);
            }
            let _ = done.send(result);
        },
    );
    let _resolver = outcome(created)
        .await
        .context("Cannot create service resolver")?;

    loop {
        match incoming.recv().await {
            Some(Update::Resolved(service)) => {
                print_resolved(&service);
                return Ok(());
            }
            Some(Update::Failure(error)) => bail!("Resolving {} failed: {}", name, error),
            Some(Update::ErrorLog(message)) => eprintln!("{}", message),
            _ => bail!("Resolver for {} stopped without a result", name),
        }
    }
}

async fn reconfirm(client: &Client, name: &str, record_type: u16) -> anyhow::Result<()> {
    let (updates, mut incoming) = mpsc::unbounded_channel();
    let (done, created) = oneshot::channel();

    client.create_record_browser(
        IF_UNSPEC,
        PROTO_UNSPEC,
        name,
        dns_class::IN,
        record_type,
        LookupFlags::empty(),
        move |result: avahi_async::Result<Arc<RecordBrowser>>| {
            if let Ok(browser) = &result {
                forward_record_browser(browser, &updates);
            }
            let _ = done.send(result);
        },
    );
    let _browser = outcome(created)
        .await
        .context("Cannot create record browser")?;

    let mut pending = Vec::new();
    loop {
        match incoming.recv().await {
            Some(Update::RecordNew(item)) => {
                let (done, reply) = completion();
                client.reconfirm_record(
                    item.interface,
                    item.protocol,
                    &item.name,
                    item.class,
                    item.record_type,
                    &item.data,
                    done,
                );
                pending.push((item, reply));
            }
            Some(Update::Failure(error)) => bail!("Browsing failed: {}", error),
            Some(Update::AllForNow) | None => break,
            Some(Update::ErrorLog(message)) => eprintln!("{}", message),
            Some(_) => {}
        }
    }

    for (item, reply) in pending {
        match outcome(reply).await {
            Ok(()) => println!("Reconfirmed {} ({})", item.name, hex(&item.data)),
            Err(e) => eprintln!("Error on reconfirmation of \"{}\": {}", item.name, e),
        }
    }

    Ok(())
}

async fn publish(
    client: &Client,
    name: &str,
    service_type: &str,
    domain: &str,
    port: u16,
    txt: &[String],
    subtypes: &[String],
) -> anyhow::Result<()> {
    let txt = txt_from_pairs(txt);

    let (updates, mut incoming) = mpsc::unbounded_channel();
    let (done, created) = oneshot::channel();

    client.create_entry_group(move |result: avahi_async::Result<Arc<EntryGroup>>| {
        if let Ok(group) = &result {
            let tx = updates.clone();
            group.state_changed().connect(move |(state, error)| {
                let _ = tx.send(Update::GroupState(*state, error.clone()));
            });
            forward_error_log(group.error_log(), &updates);
        }
        let _ = done.send(result);
    });
    let group = outcome(created)
        .await
        .context("Cannot create entry group")?;

    let (done, reply) = completion();
    group.add_service(
        IF_UNSPEC,
        PROTO_UNSPEC,
        PublishFlags::empty(),
        name,
        service_type,
        domain,
        "",
        port,
        &txt,
        done,
    );
    outcome(reply).await.context("Cannot add service")?;

    for subtype in subtypes {
        let (done, reply) = completion();
        group.add_service_subtype(
            IF_UNSPEC,
            PROTO_UNSPEC,
            PublishFlags::empty(),
            name,
            service_type,
            domain,
            subtype,
            done,
        );
        outcome(reply)
            .await
            .with_context(|| format!("Cannot add subtype {}", subtype))?;
    }

    let (done, reply) = completion();
    group.commit(done);
    outcome(reply).await.context("Cannot commit entry group")?;

    loop {
        let update = tokio::select! {
            update = incoming.recv() => update,
            _ = tokio::signal::ctrl_c() => break,
        };

        match update {
            Some(Update::GroupState(EntryGroupState::Established, _)) => {
                println!("Published {} ({}) on port {}", name, service_type, port)
            }
            Some(Update::GroupState(EntryGroupState::Collision, _)) => {
                bail!("Service name \"{}\" is already taken", name)
            }
            Some(Update::GroupState(EntryGroupState::Failure, error)) => {
                bail!("Publishing failed: {}", error)
            }
            Some(Update::GroupState(state, _)) => debug!("Entry group is {}", state),
            Some(Update::ErrorLog(message)) => eprintln!("{}", message),
            Some(_) => {}
            None => break,
        }
    }

    info!("Withdrawing {}", name);
    Ok(())
}
