use crate::prelude::*;
use crate::config::validate_configs;

/// A bound, listening TCP endpoint together with the server blocks that share
/// its `(host, port)` pair (i.e. the virtual hosts reachable through it).
struct Listener {
    listener: TcpListener,
    configs: Vec<Arc<ServerConfig>>,
}

/// The Reactor (§4.8): owns the listen sockets, the connection table, the
/// CGI-pipe-token → client-token reverse map, and the zombie-child purgatory,
/// and drives all of it from a single `mio::Poll`.
///
/// Single-threaded by construction: every field below is touched from exactly
/// one call stack, `run`'s event loop, so nothing here needs synchronization.
pub struct Server {
    listeners: HashMap<Token, Listener>,
    pub connections: HashMap<Token, HttpConnection>,
    pub cgi_to_client: HashMap<Token, Token>,
    pub zombie_purgatory: Vec<std::process::Child>,
    next_token: usize,
}

impl Server {
    /// Binds one listener per distinct `(host, port)` pair found across all
    /// server blocks; blocks that share a pair become virtual hosts selected
    /// later by `HttpConnection::resolve_config` on the `Host` header.
    pub fn new(config: AppConfig, poll: &Poll) -> Result<Self> {
        let server_configs = validate_configs(config.servers);

        let mut by_addr: HashMap<SocketAddr, Vec<Arc<ServerConfig>>> = HashMap::new();
        for cfg in server_configs {
            let cfg = Arc::new(cfg);
            for port in &cfg.ports {
                let addr: SocketAddr = format!("{}:{}", cfg.host, port).parse()?;
                by_addr.entry(addr).or_default().push(Arc::clone(&cfg));
            }
        }

        if by_addr.is_empty() {
            return Err("configuration defines no listen addresses".into());
        }

        let mut listeners = HashMap::new();
        let mut next_token = 0usize;

        for (addr, configs) in by_addr {
            let mut listener = TcpListener::bind(addr)?;
            let token = Token(next_token);
            next_token += 1;

            poll.registry()
                .register(&mut listener, token, Interest::READABLE)?;

            info!(
                "listening on {} ({} virtual host{})",
                addr,
                configs.len(),
                if configs.len() == 1 { "" } else { "s" }
            );

            listeners.insert(token, Listener { listener, configs });
        }

        Ok(Self {
            listeners,
            connections: HashMap::new(),
            cgi_to_client: HashMap::new(),
            zombie_purgatory: Vec::new(),
            next_token,
        })
    }

    /// The run-forever dispatcher: `poll → dispatch each event by fd class →
    /// sweep deadlines → reap zombies`, repeated until the process is killed.
    /// An error handling one event closes only that one connection; it never
    /// escapes to affect a sibling.
    pub fn run(mut self, mut poll: Poll) -> Result<()> {
        let mut events = Events::with_capacity(1024);

        loop {
            match poll.poll(&mut events, Some(Duration::from_millis(250))) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    errors!("poll() failed: {}", e);
                    continue;
                }
            }

            for event in events.iter() {
                let token = event.token();

                if self.listeners.contains_key(&token) {
                    self.accept_connections(&poll, token);
                    continue;
                }

                if let Some(&client_token) = self.cgi_to_client.get(&token) {
                    let should_terminate = match self.connections.get_mut(&client_token) {
                        Some(conn) => {
                            let failed = handle_cgi_event(
                                &poll,
                                event,
                                token,
                                client_token,
                                conn,
                                &mut self.cgi_to_client,
                            )
                            .is_err();
                            failed || conn.should_close()
                        }
                        None => false,
                    };
                    if should_terminate {
                        HttpConnection::terminate_connection(&mut self, client_token);
                    }
                    continue;
                }

                self.dispatch_connection_event(&poll, token, event);
            }

            timeouts::process(&mut self, &poll);
            self.reap_zombies();
        }
    }

    /// Runs the read/write phases for one ready Connection, then tears it
    /// down if either phase failed or the response cycle finished on a
    /// `Connection: close` outcome.
    fn dispatch_connection_event(&mut self, poll: &Poll, token: Token, event: &Event) {
        let should_terminate = match self.connections.get_mut(&token) {
            Some(conn) => {
                conn.touch();
                let mut failed = false;

                if event.is_readable() {
                    failed |= HttpConnection::handle_read_phase(
                        conn,
                        poll,
                        token,
                        &mut self.next_token,
                        &mut self.cgi_to_client,
                    )
                    .is_err();
                }

                if !failed && event.is_writable() {
                    failed |= HttpConnection::handle_write_phase(
                        conn,
                        poll,
                        token,
                        &mut self.next_token,
                        &mut self.cgi_to_client,
                    )
                    .is_err();
                }

                failed || conn.should_close()
            }
            None => false,
        };

        if should_terminate {
            HttpConnection::terminate_connection(self, token);
        }
    }

    /// Drains one listener's accept backlog. Each accepted fd is set
    /// non-blocking by mio, registered read-interest-only, and wrapped in a
    /// fresh `HttpConnection` carrying that listener's virtual-host list.
    fn accept_connections(&mut self, poll: &Poll, listener_token: Token) {
        loop {
            let accepted = match self.listeners.get_mut(&listener_token) {
                Some(l) => l.listener.accept(),
                None => return,
            };

            let (mut stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    errors!("accept() failed: {}", e);
                    return;
                }
            };

            if self.connections.len() >= MAX_CONNECTIONS && !self.evict_oldest_idle() {
                debug!("connection table full, dropping new peer {}", peer_addr);
                let _ = stream.shutdown(Shutdown::Both);
                continue;
            }

            let conn_token = Token(self.next_token);
            self.next_token += 1;

            if let Err(e) = poll
                .registry()
                .register(&mut stream, conn_token, Interest::READABLE)
            {
                errors!("failed to register accepted socket: {}", e);
                continue;
            }

            let configs = self
                .listeners
                .get(&listener_token)
                .map(|l| l.configs.clone())
                .unwrap_or_default();

            trace!("accepted {:?} from {} as {:?}", listener_token, peer_addr, conn_token);
            self.connections
                .insert(conn_token, HttpConnection::new(stream, configs));
        }
    }

    /// Evicts the least-recently-active connection that is not mid-request
    /// (no pending CGI pipe, no in-flight response) to make room for a new
    /// accept. Returns `false` if every slot is currently busy.
    fn evict_oldest_idle(&mut self) -> bool {
        let victim = self
            .connections
            .iter()
            .filter(|(_, c)| matches!(c.action, ActiveAction::None) && c.cgi_out_token.is_none())
            .min_by_key(|(_, c)| c.last_activity)
            .map(|(token, _)| *token);

        match victim {
            Some(token) => {
                debug!("connection table full, evicting idle {:?}", token);
                HttpConnection::terminate_connection(self, token);
                true
            }
            None => false,
        }
    }

    /// Reaps CGI children left behind by connections that were torn down
    /// before their child exited (§9: a reaper must run independently of
    /// connection lifetime, or zombies accumulate).
    fn reap_zombies(&mut self) {
        self.zombie_purgatory.retain_mut(|child| match child.try_wait() {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(_) => false,
        });
    }
}
