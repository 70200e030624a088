use anyhow::{anyhow, Context, Result};
use clap::{clap_app, ArgMatches};
use dpu_provision_lib::{
    config::{parse_slot, ProvisioningConfig},
    provision::{http, workflow},
};
use log::{error, info, LevelFilter};
use std::{path::PathBuf, process};

fn init_logging(verbosity: u64) {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.filter_level(match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

/// Command line options override the configuration file.
fn apply_pxeboot_options(config: &mut ProvisioningConfig, matches: &ArgMatches) -> Result<()> {
    if let Some(media) = matches.value_of("media") {
        config.media = Some(media.to_owned());
    }
    if let Some(device) = matches.value_of("device") {
        config.device = device.parse()?;
    }
    if let Some(interface) = matches.value_of("interface") {
        config.interface = interface.to_owned();
    }
    if let Some(kind) = matches.value_of("media_kind") {
        config.media_kind = kind.parse()?;
    }
    if let Some(policy) = matches.value_of("dhcp_restricted") {
        config.dhcp_restricted = policy.parse()?;
    }
    if let Some(keys) = matches.values_of("ssh_key") {
        config.ssh_keys.extend(keys.map(String::from));
    }
    if let Some(wait) = matches.value_of("console_wait") {
        config.console_wait_s = wait.parse().with_context(|| format!("Invalid console wait {:?}", wait))?;
    }
    if matches.is_present("prompt") {
        config.prompt = true;
    }
    Ok(())
}

fn apply_fwupdate_options(config: &mut ProvisioningConfig, matches: &ArgMatches) -> Result<()> {
    if let Some(image) = matches.value_of("image") {
        config.flash.image = Some(PathBuf::from(image));
    }
    if let Some(slot) = matches.value_of("slot") {
        config.flash.slot = parse_slot(slot)?;
    }
    Ok(())
}

fn run(matches: &ArgMatches) -> Result<()> {
    let mut config = ProvisioningConfig::load(matches.value_of("config").map(PathBuf::from).as_deref())?;

    match matches.subcommand() {
        ("pxeboot", Some(sub)) => {
            apply_pxeboot_options(&mut config, sub)?;
            config.validate()?;
            let success = workflow::pxeboot(config).context("Failure to pxeboot")?;
            info!("{}", success);
        }
        ("fwupdate", Some(sub)) => {
            apply_fwupdate_options(&mut config, sub)?;
            config.validate()?;
            workflow::fwupdate(config).context("Failure to update firmware")?;
            info!("SUCCESS. Firmware update issued");
        }
        ("reset", Some(_)) => {
            let path = workflow::reset(&config).context("Failure to reset")?;
            info!("SUCCESS. Card reset ({:?})", path);
        }
        ("serve-http", Some(sub)) => {
            let root = sub.value_of("root").map(PathBuf::from).unwrap_or_else(|| config.paths.www_root.clone());
            let port = match sub.value_of("port") {
                Some(port) => port.parse().with_context(|| format!("Invalid port {:?}", port))?,
                None => config.network.http_port,
            };
            http::serve_blocking(root, port)?;
        }
        _ => return Err(anyhow!("No subcommand given, see --help")),
    }
    Ok(())
}

fn main() {
    let matches = clap_app!(app =>
        (name: env!("CARGO_PKG_NAME"))
        (version: env!("CARGO_PKG_VERSION"))
        (about: env!("CARGO_PKG_DESCRIPTION"))
        (@arg verbose: -v ... "Log more (debug, then trace)")
        (@arg config: -c --config +takes_value "RON configuration file")
        (@subcommand pxeboot =>
            (about: "Install an ISO on the card through UEFI PXE boot")
            (@arg media: "Install media, a path or an HTTP(S) URL")
            (@arg device: -d --device +takes_value "primary, secondary, a boot entry index or a MAC address")
            (@arg interface: -i --interface +takes_value "Host interface wired to the card")
            (@arg media_kind: --("media-kind") +takes_value "auto, rhel or rhcos")
            (@arg dhcp_restricted: --("dhcp-restricted") +takes_value "auto, yes or no")
            (@arg ssh_key: -S --("ssh-key") +takes_value +multiple number_of_values(1) "Public key to authorize")
            (@arg console_wait: -w --("console-wait") +takes_value "Seconds to keep logging the console")
            (@arg prompt: -p --prompt "Wait for ENTER once the services are up")
        )
        (@subcommand fwupdate =>
            (about: "Flash a firmware image through U-Boot")
            (@arg image: "Firmware image file")
            (@arg slot: -s --slot +takes_value "primary or secondary SPI flash")
        )
        (@subcommand reset =>
            (about: "Reset the card through its management console")
        )
        (@subcommand serve_http =>
            (name: "serve-http")
            (about: "Serve a directory over HTTP (used internally)")
            (@arg root: --root +takes_value "Directory to serve")
            (@arg port: --port +takes_value "TCP port")
        )
    )
    .get_matches();

    init_logging(matches.occurrences_of("verbose"));

    if let Err(e) = run(&matches) {
        error!("{:#}", e);
        process::exit(1);
    }
}
