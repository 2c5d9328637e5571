use objwire::demo::CounterService;
use objwire_protocol::{ServeMode, Server, ServerConfig, ShutdownHandle};
use objwire_transport::Endpoint;

use crate::cmd::ServeArgs;
use crate::exit::{rpc_error, CliError, CliResult, INTERNAL, SUCCESS};

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let endpoint = endpoint_for(&args)?;
    let config = ServerConfig::default()
        .with_mode(args.mode)
        .with_endpoint(endpoint);
    let server = Server::bind(config, CounterService::handler())
        .map_err(|err| rpc_error("bind failed", err))?;

    // Library mode exits with its only session; Ctrl-C keeps its default.
    if args.mode != ServeMode::Library {
        install_ctrlc_handler(server.shutdown_handle())?;
    }

    tracing::info!(
        endpoint = %server.local_endpoint(),
        mode = %args.mode,
        "serving counter service"
    );
    server
        .serve()
        .map_err(|err| rpc_error("serve failed", err))?;
    Ok(SUCCESS)
}

fn endpoint_for(args: &ServeArgs) -> CliResult<Endpoint> {
    if let Some(path) = &args.unix {
        return Ok(Endpoint::Unix(path.clone()));
    }

    let port = match (args.mode, args.port) {
        (ServeMode::Library, port) => port.unwrap_or(0),
        (_, Some(port)) if port != 0 => port,
        (mode, _) => {
            return Err(CliError::usage(format!(
                "{mode} mode needs a non-zero --port"
            )))
        }
    };
    Ok(Endpoint::Tcp {
        host: args.host.clone(),
        port,
    })
}

fn install_ctrlc_handler(shutdown: ShutdownHandle) -> CliResult<()> {
    ctrlc::set_handler(move || {
        tracing::info!("interrupt received, shutting down");
        shutdown.shutdown();
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::exit::USAGE;

    fn args(mode: ServeMode, port: Option<u16>) -> ServeArgs {
        ServeArgs {
            mode,
            host: "127.0.0.1".to_string(),
            port,
            unix: None,
        }
    }

    #[test]
    fn library_mode_defaults_to_any_port() {
        let endpoint = endpoint_for(&args(ServeMode::Library, None)).unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: 0
            }
        );
    }

    #[test]
    fn simple_and_threaded_modes_need_a_port() {
        for mode in [ServeMode::Simple, ServeMode::Threaded] {
            let err = endpoint_for(&args(mode, None)).unwrap_err();
            assert_eq!(err.code, USAGE);
            let err = endpoint_for(&args(mode, Some(0))).unwrap_err();
            assert_eq!(err.code, USAGE);
        }
        assert!(endpoint_for(&args(ServeMode::Threaded, Some(7000))).is_ok());
    }

    #[test]
    fn unix_socket_overrides_tcp() {
        let mut serve = args(ServeMode::Simple, None);
        serve.unix = Some(PathBuf::from("/tmp/objwire.sock"));
        assert_eq!(
            endpoint_for(&serve).unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/objwire.sock"))
        );
    }
}
