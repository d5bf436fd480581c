use std::{
    future::Future,
    io,
    net::SocketAddr,
    pin::{pin, Pin},
    task::{Context, Poll},
    time::Duration,
};

use futures_util::{
    stream::{self, FusedStream, FuturesUnordered},
    Stream, StreamExt,
};
use pin_project_lite::pin_project;
use rhubarb_proto::{Host, ServerAddr};
use tokio::{
    net::{self, TcpStream},
    time::{self, Sleep},
};

const NEXT_ATTEMPT_DELAY: Duration = Duration::from_millis(250);

/// Open a TCP connection to a server address.
///
/// An IP address is dialed directly. A DNS hostname is resolved and its
/// records dialed with the [Happy Eyeballs] strategy: alternate address
/// families, start an additional attempt every 250ms, first established
/// connection wins.
///
/// [Happy Eyeballs]: https://en.wikipedia.org/wiki/Happy_Eyeballs
///
/// # Errors
///
/// It returns an error if no address could be connected to.
pub async fn dial_tcp(addr: &ServerAddr) -> io::Result<TcpStream> {
    match addr.host() {
        Host::Ip(ip) => TcpStream::connect(SocketAddr::new(*ip, addr.port())).await,
        Host::Dns(host) => {
            let host = <_ as AsRef<str>>::as_ref(host);
            let records = net::lookup_host(format!("{}:{}", host, addr.port())).await?;

            let mut race = pin!(DialRace::new(stream::iter(records)));
            let mut last_err = None;
            loop {
                match race.next().await {
                    Some(Ok(conn)) => return Ok(conn),
                    Some(Err(err)) => last_err = Some(err),
                    None => {
                        return Err(last_err.unwrap_or_else(|| {
                            io::Error::new(
                                io::ErrorKind::InvalidInput,
                                "could not resolve to any address",
                            )
                        }));
                    }
                }
            }
        }
    }
}

pin_project! {
    #[project = DialRaceProj]
    struct DialRace<D> {
        resolver: Option<D>,
        resolved: Vec<SocketAddr>,
        attempts: FuturesUnordered<
            Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send + Sync + 'static>>,
        >,
        last_family: Option<AddrFamily>,
        #[pin]
        next_attempt_delay: Option<Sleep>,
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum AddrFamily {
    V4,
    V6,
}

impl<D> DialRace<D> {
    fn new(resolver: D) -> Self {
        Self {
            resolver: Some(resolver),
            resolved: Vec::new(),
            attempts: FuturesUnordered::new(),
            last_family: None,
            next_attempt_delay: None,
        }
    }
}

impl<D> DialRaceProj<'_, D> {
    // Prefer the address family opposite to the last attempt
    fn next_record(&mut self) -> Option<SocketAddr> {
        if self.resolved.is_empty() {
            return None;
        }

        let preferred = self
            .last_family
            .map_or(AddrFamily::V6, AddrFamily::opposite);
        for i in 0..self.resolved.len() {
            if AddrFamily::of(self.resolved[i]) == preferred {
                *self.last_family = Some(preferred);
                return Some(self.resolved.remove(i));
            }
        }

        let record = self.resolved.remove(0);
        *self.last_family = Some(AddrFamily::of(record));
        Some(record)
    }
}

impl<D> Stream for DialRace<D>
where
    D: Stream<Item = SocketAddr> + Unpin,
{
    type Item = io::Result<TcpStream>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        let mut dead_end = true;

        while let Some(resolver) = &mut this.resolver {
            match Pin::new(&mut *resolver).poll_next(cx) {
                Poll::Pending => {
                    dead_end = false;
                    break;
                }
                Poll::Ready(Some(record)) => {
                    dead_end = false;
                    this.resolved.push(record);
                }
                Poll::Ready(None) => *this.resolver = None,
            }
        }

        loop {
            match Pin::new(&mut this.attempts).poll_next(cx) {
                Poll::Pending => dead_end = false,
                Poll::Ready(Some(maybe_conn)) => return Poll::Ready(Some(maybe_conn)),
                Poll::Ready(None) => {}
            }

            let start_new_attempt = if this.attempts.is_empty() {
                true
            } else if let Some(next_attempt_delay) = this.next_attempt_delay.as_mut().as_pin_mut() {
                match next_attempt_delay.poll(cx) {
                    Poll::Pending => false,
                    Poll::Ready(()) => {
                        this.next_attempt_delay.set(None);
                        true
                    }
                }
            } else {
                true
            };
            if !start_new_attempt {
                break;
            }

            match this.next_record() {
                Some(record) => {
                    let conn_fut = TcpStream::connect(record);
                    this.attempts.push(Box::pin(conn_fut));
                    this.next_attempt_delay
                        .set(Some(time::sleep(NEXT_ATTEMPT_DELAY)));
                }
                None => break,
            }
        }

        if dead_end {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (mut len, mut max) = self
            .resolver
            .as_ref()
            .map_or((0, Some(0)), Stream::size_hint);
        len = len.saturating_add(self.resolved.len() + self.attempts.len());
        if let Some(max) = &mut max {
            *max = max.saturating_add(self.resolved.len() + self.attempts.len());
        }
        (len, max)
    }
}

impl<D> FusedStream for DialRace<D>
where
    D: Stream<Item = SocketAddr> + Unpin,
{
    fn is_terminated(&self) -> bool {
        self.resolver.is_none() && self.resolved.is_empty() && self.attempts.is_empty()
    }
}

impl AddrFamily {
    fn of(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self::V4,
            SocketAddr::V6(_) => Self::V6,
        }
    }

    fn opposite(self) -> Self {
        match self {
            Self::V4 => Self::V6,
            Self::V6 => Self::V4,
        }
    }
}
