use embedded_time::Instant;
use newt_msg::opt::known::observe::Action;
use newt_msg::{Code, CodeKind, Id, Message, MessageOptions, Token, TryFromBytes, TryIntoBytes, Type};
use no_std_net::SocketAddr;
use std_alloc::format;
use std_alloc::string::String;
use std_alloc::vec::Vec;

use crate::config::Config;
use crate::error::{Error, Failure};
use crate::exchange::{ConState, Exchange, Origin, Watch};
use crate::layer::{Ctx, Effect, Signal, Stack};
use crate::net::{Addrd, Socket};
use crate::req::Req;
use crate::resp::{code, Resp};
use crate::store::{Key, Store};
use crate::time::{Clock, TimerEvent, Timers};

/// A CoAP endpoint: one socket, one clock, one immutable [`Config`],
/// the exchange [`Store`], the timer queue, and the layer [`Stack`].
///
/// Everything is driven from the caller's thread by polling: the
/// `poll_*` methods drain due timers and the socket, push messages
/// through the layers, and surface whatever became ready.
/// No state is shared and nothing runs in the background, which is
/// why a run against the mock clock and socket is fully
/// deterministic.
#[derive(Debug)]
pub struct Endpoint<Clk: Clock, Sock: Socket> {
  clock: Clk,
  sock: Sock,
  config: Config,
  store: Store<Clk>,
  timers: Timers<Clk>,
  stack: Stack<Clk>,
  req_queue: Vec<Addrd<Req>>,
}

fn summary(msg: &Message) -> String {
  format!("{:?} {} {:?} {}b",
          msg.ty,
          msg.code,
          msg.id,
          msg.payload.0.len())
}

impl<Clk: Clock + 'static, Sock: Socket> Endpoint<Clk, Sock> {
  /// Create an endpoint and arm its periodic store sweep
  pub fn new(clock: Clk, sock: Sock, config: Config) -> Self {
    let store = Store::new(&config);
    let mut timers = Timers::new();

    if let Ok(now) = clock.try_now() {
      timers.schedule_after(now, config.mark_and_sweep_interval, TimerEvent::Sweep);
    }

    Self { clock,
           sock,
           config,
           store,
           timers,
           stack: Stack::new(),
           req_queue: Vec::new() }
  }

  /// The endpoint's configuration
  pub fn config(&self) -> Config {
    self.config
  }

  /// The clock this endpoint tells time by
  pub fn clock(&self) -> &Clk {
    &self.clock
  }

  /// The address the endpoint's socket is bound to
  pub fn local_addr(&self) -> SocketAddr {
    self.sock.local_addr()
  }

  fn try_now(&self) -> Result<Instant<Clk>, Error<Sock::Error>> {
    self.clock.try_now().map_err(|_| Error::Clock)
  }

  /// Submit a request. The token correlating its response(s) is
  /// returned; poll for them with [`Endpoint::poll_resp`].
  ///
  /// A missing token or message ID is assigned here.
  pub fn send_req(&mut self, req: Addrd<Req>) -> Result<Addrd<Token>, Error<Sock::Error>> {
    self.send_req_watched(req, Watch::none())
  }

  /// [`Endpoint::send_req`], with an observer receiving the
  /// exchange's lifecycle transitions
  pub fn send_req_watched(&mut self,
                          req: Addrd<Req>,
                          watch: Watch)
                          -> Result<Addrd<Token>, Error<Sock::Error>> {
    let Addrd(req, addr) = req;
    let now = self.try_now()?;
    let mut msg = Message::from(req);

    if msg.token.is_empty() {
      msg.token = self.store.next_token(addr);
    } else if let Some(old) = self.store.by_token(addr, msg.token) {
      // one live local exchange per (peer, token)
      self.cancel_key(old, now);
    }

    let token = msg.token;
    let mut ex = Exchange::new(Origin::Local, addr, msg, now);
    ex.watch = watch;

    let key = self.store.insert(ex);
    self.transmit(key)?;

    Ok(Addrd(token, addr))
  }

  /// Register interest in a resource (GET + Observe=0).
  ///
  /// Each fresh notification surfaces as another
  /// [`Endpoint::poll_resp`] result for the returned token.
  pub fn observe(&mut self, req: Addrd<Req>) -> Result<Addrd<Token>, Error<Sock::Error>> {
    let Addrd(mut req, addr) = req;
    req.msg_mut().set_observe(Action::Register);
    self.send_req(Addrd(req, addr))
  }

  /// End an observe relation (GET + Observe=1 reusing the token)
  pub fn unobserve(&mut self, to: Addrd<Token>) -> Result<(), Error<Sock::Error>> {
    let Addrd(token, addr) = to;
    let key = self.store
                  .by_token(addr, token)
                  .ok_or(Error::UnknownExchange)?;

    if let Some(ex) = self.store.get_mut(key) {
      ex.request.set_observe(Action::Deregister);
      ex.request.id = Id(0);
    }

    self.transmit(key)
  }

  /// Cancel an exchange: its timers are disarmed, its entries leave
  /// both indices, and its observer (if any) hears `cancelled`.
  pub fn cancel(&mut self, to: Addrd<Token>) {
    let Addrd(token, addr) = to;
    if let Some(key) = self.store.by_token(addr, token) {
      let now = self.try_now().ok();
      if let Some(now) = now {
        self.cancel_key(key, now);
      }
    }
  }

  fn cancel_key(&mut self, key: Key, now: Instant<Clk>) {
    let ids: Vec<Id> = self.store
                           .get(key)
                           .map(|ex| {
                             ex.response
                               .iter()
                               .chain(core::iter::once(&ex.request))
                               .map(|m| m.id)
                               .collect()
                           })
                           .unwrap_or_default();

    if let Some(ex) = self.store.get_mut(key) {
      let (addr, token) = (ex.addr, ex.token());
      ex.watch.cancelled();
      if ex.con.is_some() {
        ex.con = Some(ConState::Cancelled);
      }
      ex.complete(now, Err(Failure::Cancelled));

      self.timers.cancel(|ev| match ev {
                    | TimerEvent::Retransmit { addr: a, id } => *a == addr && ids.contains(id),
                    | TimerEvent::Reregister { addr: a, token: t }
                    | TimerEvent::BlockwiseExpiry { addr: a, token: t } => {
                      *a == addr && *t == token
                    },
                    | TimerEvent::Sweep => false,
                  });
    }

    self.store.remove(key);
  }

  /// Poll for a response (or the next notification) to the exchange
  /// named by `token`/`addr`.
  pub fn poll_resp(&mut self,
                   token: Token,
                   addr: SocketAddr)
                   -> nb::Result<Resp, Error<Sock::Error>> {
    self.tick().map_err(nb::Error::Other)?;

    let key = self.store
                  .by_token(addr, token)
                  .ok_or(nb::Error::Other(Error::UnknownExchange))?;

    let (msg, drop_now) = {
      let ex = self.store
                   .get_mut(key)
                   .ok_or(nb::Error::Other(Error::UnknownExchange))?;

      if ex.ready.is_empty() {
        return match ex.completed {
          | Some(Err(f)) => Err(nb::Error::Other(Error::Failed(f))),
          | _ => Err(nb::Error::WouldBlock),
        };
      }

      let msg = ex.ready.remove(0);
      // non-confirmable exchanges die as soon as they're drained;
      // confirmable ones stay for duplicate detection until swept
      let drop_now = ex.is_completed()
                     && ex.ready.is_empty()
                     && ex.request.ty == Type::Non
                     && !ex.observing();
      (msg, drop_now)
    };

    if drop_now {
      self.store.remove(key);
    }

    Ok(Resp::from(msg))
  }

  /// Poll for an incoming request (the server half of the endpoint)
  pub fn poll_req(&mut self) -> nb::Result<Addrd<Req>, Error<Sock::Error>> {
    self.tick().map_err(nb::Error::Other)?;

    if self.req_queue.is_empty() {
      Err(nb::Error::WouldBlock)
    } else {
      Ok(self.req_queue.remove(0))
    }
  }

  /// Answer a request previously yielded by [`Endpoint::poll_req`].
  ///
  /// When the requesting exchange holds an observe relation the
  /// response is routed through [`Endpoint::notify`] instead, so it
  /// picks up a notification counter and the in-transit bookkeeping.
  pub fn respond(&mut self, to: Addrd<Token>, rep: Resp) -> Result<(), Error<Sock::Error>> {
    let Addrd(token, addr) = to;
    let key = self.store
                  .by_token(addr, token)
                  .ok_or(Error::UnknownExchange)?;

    if self.store.get(key).map(|ex| ex.observing()).unwrap_or(false) {
      return self.notify(to, rep);
    }

    let now = self.try_now()?;
    let mut msg = Message::from(rep);
    msg.token = token;

    // the empty ACK went out when the request arrived, so the
    // response always travels separately, as a new CON with its
    // own ID
    if msg.ty == Type::Ack {
      msg.ty = Type::Con;
      msg.id = Id(0);
    }

    if msg.id == Id(0) {
      let id = self.store.next_id(addr);
      msg.id = id;
      self.store.index_id(key, addr, id);
    }

    let mut effects = Vec::new();
    let outcome = {
      let Self { ref mut stack,
                 ref mut store,
                 ref mut timers,
                 config,
                 .. } = *self;

      let ex = store.get_mut(key).ok_or(Error::UnknownExchange)?;
      let mut ctx = Ctx { now,
                          config,
                          effects: &mut effects,
                          timers };

      let outcome = stack.send_response(&mut ctx, ex, &mut msg);
      ex.response = Some(msg.clone());
      outcome
    };

    match outcome {
      | Ok(Signal::Continue) => effects.push(Effect::Send(Addrd(msg, addr))),
      | Ok(Signal::Stop) => (),
      | Err(f) => {
        if let Some(ex) = self.store.get_mut(key) {
          ex.complete(now, Err(f));
        }
      },
    }

    self.execute(effects)
  }

  /// Push a fresh representation to an observer.
  ///
  /// At most one confirmable notification is in transit per
  /// relation; while one is, fresher representations wait in a
  /// one-deep stash, each replacing the last.
  pub fn notify(&mut self, to: Addrd<Token>, rep: Resp) -> Result<(), Error<Sock::Error>> {
    let Addrd(token, addr) = to;
    let key = self.store
                  .by_token(addr, token)
                  .ok_or(Error::UnknownExchange)?;

    let mut msg = Message::from(rep);
    msg.token = token;

    let busy = {
      let ex = self.store.get_mut(key).ok_or(Error::UnknownExchange)?;
      let rel = ex.relation.as_mut().ok_or(Error::UnknownExchange)?;

      match rel.in_transit {
        | Some(_) => {
          // freshness replacement: the newest representation wins
          rel.next_notification = Some(msg.clone());
          true
        },
        | None => false,
      }
    };

    if busy {
      return Ok(());
    }

    self.send_notification(key, msg)
  }

  fn send_notification(&mut self,
                       key: Key,
                       mut msg: Message)
                       -> Result<(), Error<Sock::Error>> {
    let now = self.try_now()?;

    let addr = match self.store.get(key) {
      | Some(ex) => ex.addr,
      | None => return Ok(()),
    };

    let id = self.store.next_id(addr);
    self.store.index_id(key, addr, id);

    {
      let config = self.config;
      let ex = self.store.get_mut(key).ok_or(Error::UnknownExchange)?;
      msg.token = ex.token();
      msg.id = id;

      if let Some(rel) = ex.relation.as_mut() {
        rel.established = true;
        rel.next_counter = (rel.next_counter + 1) & 0xFF_FF_FF;
        msg.set_observe_counter(rel.next_counter);

        // notifications default to NON, periodically promoted to CON
        // to confirm the observer still exists
        if msg.ty != Type::Con && rel.check_due(now, &config.observe) {
          msg.ty = Type::Con;
        } else if msg.ty != Type::Con {
          msg.ty = Type::Non;
        }

        match msg.ty {
          | Type::Con => {
            rel.in_transit = Some(id);
            rel.non_count = 0;
            rel.last_con_at = now;
          },
          | _ => rel.non_count += 1,
        }
      }
    }

    let mut effects = Vec::new();
    let outcome = {
      let Self { ref mut stack,
                 ref mut store,
                 ref mut timers,
                 config,
                 .. } = *self;

      let ex = store.get_mut(key).ok_or(Error::UnknownExchange)?;
      let mut ctx = Ctx { now,
                          config,
                          effects: &mut effects,
                          timers };

      let outcome = stack.send_response(&mut ctx, ex, &mut msg);
      ex.response = Some(msg.clone());
      outcome
    };

    match outcome {
      | Ok(Signal::Continue) => effects.push(Effect::Send(Addrd(msg, addr))),
      | Ok(Signal::Stop) => (),
      | Err(f) => {
        if let Some(ex) = self.store.get_mut(key) {
          ex.complete(now, Err(f));
        }
      },
    }

    self.execute(effects)
  }

  fn flush_stash(&mut self, addr: SocketAddr, token: Token) -> Result<(), Error<Sock::Error>> {
    let key = match self.store.by_token(addr, token) {
      | Some(key) => key,
      | None => return Ok(()),
    };

    let stash = self.store
                    .get_mut(key)
                    .and_then(|ex| ex.relation.as_mut())
                    .filter(|rel| rel.in_transit.is_none())
                    .and_then(|rel| rel.next_notification.take());

    match stash {
      | Some(msg) => self.send_notification(key, msg),
      | None => Ok(()),
    }
  }

  /// Check a peer is alive: a CON empty message, answered (per
  /// RFC7252 section 4.3) with RST. The RST is the success signal.
  pub fn ping(&mut self, addr: SocketAddr) -> Result<Addrd<Id>, Error<Sock::Error>> {
    let now = self.try_now()?;
    let msg = Message::new(Type::Con, Code::EMPTY, Id(0), Token::default());

    let key = self.store
                  .insert(Exchange::new(Origin::Local, addr, msg, now));
    self.transmit(key)?;

    let id = self.store.get(key).map(|ex| ex.id()).unwrap_or(Id(0));
    Ok(Addrd(id, addr))
  }

  /// Poll for the pong (the peer's RST) of a sent [`Endpoint::ping`]
  pub fn poll_ping(&mut self, id: Id, addr: SocketAddr) -> nb::Result<(), Error<Sock::Error>> {
    self.tick().map_err(nb::Error::Other)?;

    let key = self.store
                  .by_id(addr, id)
                  .ok_or(nb::Error::Other(Error::UnknownExchange))?;

    match self.store.get(key).and_then(|ex| ex.completed) {
      | Some(Ok(())) => {
        self.store.remove(key);
        Ok(())
      },
      | Some(Err(f)) => Err(nb::Error::Other(Error::Failed(f))),
      | None => Err(nb::Error::WouldBlock),
    }
  }

  /// Run the exchange's current request down the send pipeline and
  /// onto the wire, assigning a fresh ID first if it has none.
  fn transmit(&mut self, key: Key) -> Result<(), Error<Sock::Error>> {
    let now = self.try_now()?;

    let (addr, needs_id) = match self.store.get(key) {
      | Some(ex) => (ex.addr, ex.request.id == Id(0)),
      | None => return Ok(()),
    };

    if needs_id {
      let id = self.store.next_id(addr);
      if let Some(ex) = self.store.get_mut(key) {
        ex.request.id = id;
      }
      self.store.index_id(key, addr, id);
    }

    let mut effects = Vec::new();
    let (msg, outcome) = {
      let Self { ref mut stack,
                 ref mut store,
                 ref mut timers,
                 config,
                 .. } = *self;

      let ex = match store.get_mut(key) {
        | Some(ex) => ex,
        | None => return Ok(()),
      };

      let mut msg = ex.request.clone();
      let mut ctx = Ctx { now,
                          config,
                          effects: &mut effects,
                          timers };

      let outcome = match msg.code.kind() {
        | CodeKind::Empty => stack.send_empty(&mut ctx, ex, &mut msg),
        | _ => stack.send_request(&mut ctx, ex, &mut msg),
      };

      // layers may have rewritten the wire form (fragmentation);
      // retransmissions must repeat exactly what went out
      ex.request = msg.clone();
      (msg, outcome)
    };

    match outcome {
      | Ok(Signal::Continue) => effects.push(Effect::Send(Addrd(msg, addr))),
      | Ok(Signal::Stop) => (),
      | Err(f) => {
        if let Some(ex) = self.store.get_mut(key) {
          ex.complete(now, Err(f));
        }
      },
    }

    self.execute(effects)
  }

  fn execute(&mut self, effects: Vec<Effect>) -> Result<(), Error<Sock::Error>> {
    for eff in effects {
      match eff {
        | Effect::Send(Addrd(mut msg, addr)) => {
          if msg.id == Id(0) {
            msg.id = self.store.next_id(addr);
          }
          self.send_msg(Addrd(msg, addr))?;
        },
        | Effect::Transmit(Addrd(token, addr)) => {
          if let Some(key) = self.store.by_token(addr, token) {
            self.transmit(key)?;
          }
        },
        | Effect::Notify(Addrd(token, addr)) => {
          self.flush_stash(addr, token)?;
        },
        | Effect::Log(level, msg) => log::log!(target: "newt", level, "{}", msg),
      }
    }

    Ok(())
  }

  fn send_msg(&mut self, Addrd(msg, addr): Addrd<Message>) -> Result<(), Error<Sock::Error>> {
    log::debug!(target: "newt", "{:?} <- {}", addr, summary(&msg));

    let bytes = msg.try_into_bytes().map_err(Error::ToBytes)?;

    if bytes.len() > self.config.msg.max_size as usize {
      log::warn!(target: "newt",
                 "{:?} <- datagram of {}b exceeds max_size {}",
                 addr,
                 bytes.len(),
                 self.config.msg.max_size);
    }

    nb::block!(self.sock.send(Addrd(&bytes, addr))).map_err(Error::Sock)
  }

  /// Fire due timers and drain the socket
  fn tick(&mut self) -> Result<(), Error<Sock::Error>> {
    loop {
      let now = self.try_now()?;
      match self.timers.pop_due(now) {
        | Some(ev) => self.fire(now, ev)?,
        | None => break,
      }
    }

    loop {
      match self.sock
                .poll(self.config.msg.recv_buffer_size)
                .map_err(Error::Sock)?
      {
        | None => break,
        | Some(Addrd(bytes, addr)) => match Message::try_from_bytes(&bytes) {
          | Ok(msg) => self.dispatch(Addrd(msg, addr))?,
          | Err(e) => {
            // not acknowledged, not rejected: dropped
            log::debug!(target: "newt", "{:?} -> malformed datagram {:?}", addr, e)
          },
        },
      }
    }

    Ok(())
  }

  fn fire(&mut self, now: Instant<Clk>, ev: TimerEvent) -> Result<(), Error<Sock::Error>> {
    if let TimerEvent::Sweep = ev {
      let evicted = self.store.sweep(now, self.config.exchange_lifetime);
      if evicted > 0 {
        log::debug!(target: "newt", "sweep evicted {} exchanges", evicted);
      }
      self.timers
          .schedule_after(now, self.config.mark_and_sweep_interval, TimerEvent::Sweep);
      return Ok(());
    }

    let key = match ev {
      | TimerEvent::Retransmit { addr, id } => self.store.by_id(addr, id),
      | TimerEvent::Reregister { addr, token }
      | TimerEvent::BlockwiseExpiry { addr, token } => self.store.by_token(addr, token),
      | TimerEvent::Sweep => None,
    };

    let key = match key {
      | Some(key) => key,
      | None => return Ok(()),
    };

    let mut effects = Vec::new();
    let outcome = {
      let Self { ref mut stack,
                 ref mut store,
                 ref mut timers,
                 config,
                 .. } = *self;

      match store.get_mut(key) {
        | Some(ex) => {
          let mut ctx = Ctx { now,
                              config,
                              effects: &mut effects,
                              timers };
          stack.on_timer(&mut ctx, ex, &ev)
        },
        | None => Ok(Signal::Stop),
      }
    };

    if let Err(f) = outcome {
      if let Some(ex) = self.store.get_mut(key) {
        ex.complete(now, Err(f));
      }
    }

    // a confirmable notification nobody confirmed takes every
    // relation with that peer down with it
    let dead_notifier = self.store
                            .get(key)
                            .filter(|ex| {
                              ex.origin == Origin::Remote
                              && ex.relation.is_some()
                              && matches!(ex.completed, Some(Err(Failure::Timeout)))
                            })
                            .map(|ex| ex.addr);

    if let Some(addr) = dead_notifier {
      log::debug!(target: "newt",
                  "{:?} stopped confirming; cancelling its relations",
                  addr);
      for k in self.store.keys() {
        if let Some(ex) = self.store.get_mut(k) {
          if ex.addr == addr {
            ex.relation = None;
          }
        }
      }
    }

    self.execute(effects)
  }

  fn dispatch(&mut self, Addrd(msg, addr): Addrd<Message>) -> Result<(), Error<Sock::Error>> {
    log::debug!(target: "newt", "{:?} -> {}", addr, summary(&msg));

    match msg.code.kind() {
      | CodeKind::Empty => self.dispatch_empty(Addrd(msg, addr)),
      | CodeKind::Request => self.dispatch_request(Addrd(msg, addr)),
      | CodeKind::Response => self.dispatch_response(Addrd(msg, addr)),
    }
  }

  fn dispatch_empty(&mut self, Addrd(mut msg, addr): Addrd<Message>) -> Result<(), Error<Sock::Error>> {
    let now = self.try_now()?;

    if msg.ty == Type::Con {
      // a CoAP ping; the RST is the pong
      return self.send_msg(Addrd(msg.reset(), addr));
    }

    let key = match self.store.by_id(addr, msg.id) {
      | Some(key) => key,
      | None => {
        log::debug!(target: "newt", "{:?} -> stray {:?} ignored", addr, msg.ty);
        return Ok(());
      },
    };

    let mut effects = Vec::new();
    {
      let Self { ref mut stack,
                 ref mut store,
                 ref mut timers,
                 config,
                 .. } = *self;

      if let Some(ex) = store.get_mut(key) {
        let mut ctx = Ctx { now,
                            config,
                            effects: &mut effects,
                            timers };
        stack.receive_empty(&mut ctx, ex, &mut msg).ok();
      }
    }

    self.execute(effects)
  }

  fn dispatch_request(&mut self, Addrd(mut msg, addr): Addrd<Message>) -> Result<(), Error<Sock::Error>> {
    let now = self.try_now()?;

    // duplicate suppression: a CON we've already answered gets the
    // cached answer replayed, a NON is dropped silently, and neither
    // reaches the layers (or the application) again
    if let Some(key) = self.store.by_id(addr, msg.id) {
      match (msg.ty, self.store.get(key).and_then(|ex| ex.response.clone())) {
        | (Type::Con, Some(cached)) => {
          log::debug!(target: "newt", "{:?} -> duplicate CON; replaying answer", addr);
          return self.send_msg(Addrd(cached, addr));
        },
        | _ => {
          log::debug!(target: "newt", "{:?} -> duplicate dropped", addr);
          return Ok(());
        },
      }
    }

    // a critical option we don't understand is answered 4.02
    if let Some(n) = msg.unknown_critical() {
      log::warn!(target: "newt", "{:?} -> unknown critical option {:?}", addr, n);

      let rep = match msg.ty {
        | Type::Con => Message::new(Type::Ack, code::BAD_OPTION, msg.id, msg.token),
        | _ => Message::new(Type::Non, code::BAD_OPTION, Id(0), msg.token),
      };
      return self.execute(std_alloc::vec![Effect::Send(Addrd(rep, addr))]);
    }

    // follow-ups (block continuations, observe de/re-registrations)
    // reuse the exchange their token names
    let key = match self.store
                        .by_token(addr, msg.token)
                        .filter(|k| {
                          self.store
                              .get(*k)
                              .map(|ex| ex.origin == Origin::Remote)
                              .unwrap_or(false)
                        }) {
      | Some(key) => {
        if let Some(ex) = self.store.get_mut(key) {
          ex.request = msg.clone();
        }
        self.store.index_id(key, addr, msg.id);
        key
      },
      | None => {
        self.store
            .insert(Exchange::new(Origin::Remote, addr, msg.clone(), now))
      },
    };

    let mut effects = Vec::new();
    let outcome = {
      let Self { ref mut stack,
                 ref mut store,
                 ref mut timers,
                 config,
                 .. } = *self;

      match store.get_mut(key) {
        | Some(ex) => {
          let mut ctx = Ctx { now,
                              config,
                              effects: &mut effects,
                              timers };
          stack.receive_request(&mut ctx, ex, &mut msg)
        },
        | None => Ok(Signal::Stop),
      }
    };

    match outcome {
      | Ok(Signal::Continue) => {
        // confirmable requests are acknowledged up front; the
        // answer follows as a separate message. The ACK is cached
        // for duplicate replay until the real answer replaces it.
        if msg.ty == Type::Con {
          let ack = msg.ack();
          if let Some(ex) = self.store.get_mut(key) {
            ex.response = Some(ack.clone());
          }
          self.send_msg(Addrd(ack, addr))?;
        }

        self.req_queue.push(Addrd(Req::from(msg), addr));
      },
      | Ok(Signal::Stop) => (),
      | Err(f) => {
        if let Some(ex) = self.store.get_mut(key) {
          ex.complete(now, Err(f));
        }
      },
    }

    self.execute(effects)
  }

  fn dispatch_response(&mut self, Addrd(mut msg, addr): Addrd<Message>) -> Result<(), Error<Sock::Error>> {
    let now = self.try_now()?;

    // a retransmitted separate CON response only needs its ACK again
    if msg.ty != Type::Ack {
      let seen = self.store
                     .by_id(addr, msg.id)
                     .and_then(|k| self.store.get(k))
                     .map(|ex| ex.rx_ids.contains(&msg.id))
                     .unwrap_or(false);

      if seen {
        log::debug!(target: "newt", "{:?} -> duplicate response", addr);
        if msg.ty == Type::Con {
          return self.send_msg(Addrd(msg.ack(), addr));
        }
        return Ok(());
      }
    }

    let key = match self.store.by_token(addr, msg.token) {
      | Some(key) => key,
      | None => {
        // a response nothing asked for: rejected
        log::debug!(target: "newt", "{:?} -> response for unknown token", addr);
        if msg.ty == Type::Con {
          return self.send_msg(Addrd(msg.reset(), addr));
        }
        return Ok(());
      },
    };

    // an unknown critical option rejects the response
    if let Some(n) = msg.unknown_critical() {
      log::warn!(target: "newt", "{:?} -> response with unknown critical option {:?}", addr, n);
      self.send_msg(Addrd(msg.reset(), addr))?;
      if let Some(ex) = self.store.get_mut(key) {
        ex.complete(now, Err(Failure::BadOption(n)));
      }
      return Ok(());
    }

    // processed or not, this ID is now known (for duplicate
    // suppression within the exchange lifetime)
    if msg.ty != Type::Ack {
      self.store.index_id(key, addr, msg.id);
      if let Some(ex) = self.store.get_mut(key) {
        ex.rx_ids.push(msg.id);
      }
    }

    let mut effects = Vec::new();
    let outcome = {
      let Self { ref mut stack,
                 ref mut store,
                 ref mut timers,
                 config,
                 .. } = *self;

      match store.get_mut(key) {
        | Some(ex) => {
          let mut ctx = Ctx { now,
                              config,
                              effects: &mut effects,
                              timers };
          stack.receive_response(&mut ctx, ex, &mut msg)
        },
        | None => Ok(Signal::Stop),
      }
    };

    match outcome {
      | Ok(Signal::Continue) => {
        if let Some(ex) = self.store.get_mut(key) {
          // a response for an exchange that already concluded (e.g.
          // a second piggybacked ACK after we retransmitted) is not
          // delivered twice
          if !ex.is_completed() || ex.observing() {
            ex.watch.responded(&msg);
            ex.ready.push(msg);
            if !ex.observing() {
              ex.complete(now, Ok(()));
            }
          }
        }
      },
      | Ok(Signal::Stop) => (),
      | Err(f) => {
        if let Some(ex) = self.store.get_mut(key) {
          ex.complete(now, Err(f));
        }
      },
    }

    self.execute(effects)
  }
}

#[cfg(test)]
mod tests {
  use ::std::sync::{Arc, Mutex};
  use newt_msg::opt::known::observe::Action;
  use newt_msg::{Block, OptNumber, OptValue};
  use std_alloc::vec::Vec;

  use super::*;
  use crate::exchange::Watcher;
  use crate::test::{deterministic_config, dummy_addr, endpoint, TestNet};

  type TestEndpoint = Endpoint<crate::test::ClockMock, crate::test::SockMock>;

  #[derive(Clone, Default)]
  struct Events(Arc<Mutex<Vec<&'static str>>>);

  impl Events {
    fn saw(&self) -> Vec<&'static str> {
      self.0.lock().unwrap().clone()
    }
  }

  impl Watcher for Events {
    fn acknowledged(&mut self) {
      self.0.lock().unwrap().push("acknowledged");
    }

    fn retransmitting(&mut self, _: u16) {
      self.0.lock().unwrap().push("retransmitting");
    }

    fn rejected(&mut self) {
      self.0.lock().unwrap().push("rejected");
    }

    fn timed_out(&mut self) {
      self.0.lock().unwrap().push("timed_out");
    }

    fn responded(&mut self, _: &Message) {
      self.0.lock().unwrap().push("responded");
    }

    fn cancelled(&mut self) {
      self.0.lock().unwrap().push("cancelled");
    }

    fn reregistering(&mut self) {
      self.0.lock().unwrap().push("reregistering");
    }
  }

  fn send_get(ep: &mut TestEndpoint, net: &TestNet) -> (Token, Id) {
    let req = Req::get(dummy_addr(), "time");
    let Addrd(token, _) = ep.send_req(Addrd(req, dummy_addr())).unwrap();

    let sent = net.drain_tx();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data().ty, Type::Con);
    (token, sent[0].data().id)
  }

  #[test]
  fn simple_get_with_piggybacked_response() {
    let (mut ep, net) = endpoint(deterministic_config());
    let events = Events::default();

    let req = Req::get(dummy_addr(), "time");
    let Addrd(token, addr) =
      ep.send_req_watched(Addrd(req, dummy_addr()), Watch::new(events.clone()))
        .unwrap();

    let sent = net.drain_tx();
    assert_eq!(sent.len(), 1);
    let id = sent[0].data().id;

    let mut rep = Message::new(Type::Ack, Code::new(2, 5), id, token);
    rep.payload.0 = b"42".to_vec();
    net.push_rx(Addrd(rep, addr));

    let rep = nb::block!(ep.poll_resp(token, addr)).unwrap();
    assert_eq!(rep.code(), Code::new(2, 5));
    assert_eq!(rep.payload(), b"42");

    // exactly one transmission, acknowledged & responded both fired
    assert!(net.drain_tx().is_empty());
    assert_eq!(events.saw(), std_alloc::vec!["acknowledged", "responded"]);
  }

  #[test]
  fn retransmit_until_empty_ack_then_separate_response() {
    let (mut ep, net) = endpoint(deterministic_config());
    let (token, id) = send_get(&mut ep, &net);
    let addr = dummy_addr();

    // T0 passes: exactly one retransmission, same ID
    ep.clock().set(2_100);
    assert!(matches!(ep.poll_resp(token, addr), Err(nb::Error::WouldBlock)));
    let sent = net.drain_tx();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data().id, id);

    // empty ACK arrives; retransmissions stop
    ep.clock().set(2_500);
    net.push_rx(Addrd(Message::new(Type::Ack, Code::EMPTY, id, Token::default()),
                      addr));
    assert!(matches!(ep.poll_resp(token, addr), Err(nb::Error::WouldBlock)));

    ep.clock().set(5_000);
    assert!(matches!(ep.poll_resp(token, addr), Err(nb::Error::WouldBlock)));
    assert!(net.drain_tx().is_empty());

    // the response arrives separately as its own CON...
    let mut rep = Message::new(Type::Con, Code::new(2, 5), Id(0x9000), token);
    rep.payload.0 = b"42".to_vec();
    net.push_rx(Addrd(rep, addr));

    let rep = nb::block!(ep.poll_resp(token, addr)).unwrap();
    assert_eq!(rep.payload(), b"42");

    // ...which we must acknowledge
    let sent = net.drain_tx();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data().ty, Type::Ack);
    assert_eq!(sent[0].data().id, Id(0x9000));
  }

  #[test]
  fn timeout_after_exhausted_retransmissions() {
    let (mut ep, net) = endpoint(deterministic_config());
    let events = Events::default();

    let req = Req::get(dummy_addr(), "time");
    let Addrd(token, addr) =
      ep.send_req_watched(Addrd(req, dummy_addr()), Watch::new(events.clone()))
        .unwrap();
    assert_eq!(net.drain_tx().len(), 1);

    // with ack_timeout 2s and no jitter, retransmissions land at
    // 2s, 4s, 8s and 16s
    for at in [2_000u64, 4_000, 8_000, 16_000] {
      ep.clock().set(at);
      assert!(matches!(ep.poll_resp(token, addr), Err(nb::Error::WouldBlock)));
      assert_eq!(net.drain_tx().len(), 1, "expected a retransmission at {}ms", at);
    }

    // the final backoff window passes in silence
    ep.clock().set(32_000);
    assert_eq!(ep.poll_resp(token, addr),
               Err(nb::Error::Other(Error::Failed(Failure::Timeout))));
    assert!(net.drain_tx().is_empty());

    assert_eq!(events.saw(),
               std_alloc::vec!["retransmitting",
                               "retransmitting",
                               "retransmitting",
                               "retransmitting",
                               "timed_out"]);
  }

  #[test]
  fn rst_rejects_the_request() {
    let (mut ep, net) = endpoint(deterministic_config());
    let (token, id) = send_get(&mut ep, &net);
    let addr = dummy_addr();

    net.push_rx(Addrd(Message::new(Type::Reset, Code::EMPTY, id, Token::default()),
                      addr));

    assert_eq!(ep.poll_resp(token, addr),
               Err(nb::Error::Other(Error::Failed(Failure::Rejected))));
  }

  #[test]
  fn duplicate_con_request_replays_the_cached_answer() {
    let (mut ep, net) = endpoint(deterministic_config());
    let addr = dummy_addr();

    let mut req = Message::new(Type::Con,
                               Code::GET,
                               Id(0x1234),
                               Token::from_bytes(&[0xAB]));
    req.set_path("time");

    net.push_rx(Addrd(req.clone(), addr));

    let got = nb::block!(ep.poll_req()).unwrap();
    assert_eq!(got.data().msg().id, Id(0x1234));

    // the request was acknowledged up front
    let sent = net.drain_tx();
    assert_eq!(sent.len(), 1);
    assert_eq!((sent[0].data().ty, sent[0].data().code),
               (Type::Ack, Code::EMPTY));

    // answer it
    let mut rep = Resp::for_request(got.data()).unwrap();
    rep.set_payload(b"hello".iter().copied());
    ep.respond(Addrd(Token::from_bytes(&[0xAB]), addr), rep).unwrap();

    let sent = net.drain_tx();
    assert_eq!(sent.len(), 1);
    let answer = sent[0].data().clone();
    assert_eq!(answer.payload.0, b"hello".to_vec());

    // the duplicate is answered from the cache; the handler never
    // sees it
    net.push_rx(Addrd(req, addr));
    assert!(matches!(ep.poll_req(), Err(nb::Error::WouldBlock)));

    let sent = net.drain_tx();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data(), &answer);
  }

  #[test]
  fn duplicate_non_request_is_dropped_silently() {
    let (mut ep, net) = endpoint(deterministic_config());
    let addr = dummy_addr();

    let mut req = Message::new(Type::Non, Code::GET, Id(7), Token::from_bytes(&[1]));
    req.set_path("x");

    net.push_rx(Addrd(req.clone(), addr));
    nb::block!(ep.poll_req()).unwrap();
    assert!(net.drain_tx().is_empty());

    net.push_rx(Addrd(req, addr));
    assert!(matches!(ep.poll_req(), Err(nb::Error::WouldBlock)));
    assert!(net.drain_tx().is_empty());
  }

  #[test]
  fn observe_delivers_fresh_and_drops_stale() {
    let (mut ep, net) = endpoint(deterministic_config());
    let addr = dummy_addr();

    let req = Req::get(addr, "temp");
    let Addrd(token, _) = ep.observe(Addrd(req, addr)).unwrap();

    let sent = net.drain_tx();
    assert_eq!(sent[0].data().observe_action(), Some(Action::Register));

    let notif = |v: u32, id: u16| {
      let mut m = Message::new(Type::Non, Code::new(2, 5), Id(id), token);
      m.set_observe_counter(v);
      m.payload.0 = std_alloc::format!("v{}", v).into_bytes();
      m
    };

    net.push_rx(Addrd(notif(5, 100), addr));
    assert_eq!(nb::block!(ep.poll_resp(token, addr)).unwrap().payload(), b"v5");

    ep.clock().set(1_000);
    net.push_rx(Addrd(notif(9, 101), addr));
    assert_eq!(nb::block!(ep.poll_resp(token, addr)).unwrap().payload(), b"v9");

    // V=7 is behind V=9 and well within the 128s window: dropped
    ep.clock().set(2_000);
    net.push_rx(Addrd(notif(7, 102), addr));
    assert!(matches!(ep.poll_resp(token, addr), Err(nb::Error::WouldBlock)));
  }

  #[test]
  fn quiet_observed_resource_triggers_reregistration() {
    let (mut ep, net) = endpoint(deterministic_config());
    let addr = dummy_addr();

    let req = Req::get(addr, "temp");
    let Addrd(token, _) = ep.observe(Addrd(req, addr)).unwrap();
    net.drain_tx();

    let mut notif = Message::new(Type::Non, Code::new(2, 5), Id(100), token);
    notif.set_observe_counter(1);
    notif.set_max_age(1);
    net.push_rx(Addrd(notif, addr));
    nb::block!(ep.poll_resp(token, addr)).unwrap();

    // Max-Age 1s + 2s backoff quiet: a fresh register goes out,
    // reusing the token
    ep.clock().set(3_000);
    assert!(matches!(ep.poll_resp(token, addr), Err(nb::Error::WouldBlock)));

    let sent = net.drain_tx();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data().observe_action(), Some(Action::Register));
    assert_eq!(sent[0].data().token, token);
  }

  #[test]
  fn block2_download_reassembles_1400_bytes() {
    let (mut ep, net) = endpoint(deterministic_config());
    let addr = dummy_addr();
    let body: Vec<u8> = (0..=255u8).cycle().take(1400).collect();

    let req = Req::get(addr, "large");
    let Addrd(token, _) = ep.send_req(Addrd(req, addr)).unwrap();
    let first = net.drain_tx();
    let mut last_id = first[0].data().id;

    for num in 0u32..3 {
      let more = num < 2;
      let range = (num as usize * 512)..(((num as usize + 1) * 512).min(1400));

      let mut rep = Message::new(Type::Ack, Code::new(2, 5), last_id, token);
      rep.set_block2(Block::new(512, num, more));
      rep.payload.0 = body[range].to_vec();
      net.push_rx(Addrd(rep, addr));

      if more {
        assert!(matches!(ep.poll_resp(token, addr), Err(nb::Error::WouldBlock)));

        // the endpoint asked for the next block, new ID, same token
        let sent = net.drain_tx();
        assert_eq!(sent.len(), 1);
        let b2 = sent[0].data().block2().unwrap();
        assert_eq!((b2.num(), b2.size()), (num + 1, 512));
        assert_eq!(sent[0].data().token, token);
        assert_ne!(sent[0].data().id, last_id);
        last_id = sent[0].data().id;
      }
    }

    let rep = nb::block!(ep.poll_resp(token, addr)).unwrap();
    assert_eq!(rep.payload(), &body[..]);
  }

  #[test]
  fn block1_upload_fragments_and_finishes() {
    let (mut ep, net) = endpoint(deterministic_config());
    let addr = dummy_addr();
    let body: Vec<u8> = (0..=255u8).cycle().take(700).collect();

    let mut req = Req::put(addr, "firmware");
    req.set_payload(body.iter().copied());

    let Addrd(token, _) = ep.send_req(Addrd(req, addr)).unwrap();

    let sent = net.drain_tx();
    let b1 = sent[0].data().block1().unwrap();
    assert_eq!((b1.num(), b1.more()), (0, true));
    assert_eq!(sent[0].data().payload.0, body[..512].to_vec());

    // 2.31 Continue: the next (final) block goes out
    let mut cont = Message::new(Type::Ack, code::CONTINUE, sent[0].data().id, token);
    cont.set_block1(Block::new(512, 0, true));
    net.push_rx(Addrd(cont, addr));

    assert!(matches!(ep.poll_resp(token, addr), Err(nb::Error::WouldBlock)));
    let sent = net.drain_tx();
    assert_eq!(sent.len(), 1);
    let b1 = sent[0].data().block1().unwrap();
    assert_eq!((b1.num(), b1.more()), (1, false));
    assert_eq!(sent[0].data().payload.0, body[512..].to_vec());

    // final response ends the exchange
    let fin = Message::new(Type::Ack, Code::new(2, 4), sent[0].data().id, token);
    net.push_rx(Addrd(fin, addr));
    assert_eq!(nb::block!(ep.poll_resp(token, addr)).unwrap().code(),
               Code::new(2, 4));
  }

  #[test]
  fn ping_pongs_on_rst() {
    let (mut ep, net) = endpoint(deterministic_config());
    let addr = dummy_addr();

    let Addrd(id, _) = ep.ping(addr).unwrap();
    let sent = net.drain_tx();
    assert_eq!((sent[0].data().ty, sent[0].data().code),
               (Type::Con, Code::EMPTY));

    net.push_rx(Addrd(Message::new(Type::Reset, Code::EMPTY, id, Token::default()),
                      addr));
    assert_eq!(nb::block!(ep.poll_ping(id, addr)), Ok(()));
  }

  #[test]
  fn incoming_ping_is_answered_with_rst() {
    let (mut ep, net) = endpoint(deterministic_config());
    let addr = dummy_addr();

    net.push_rx(Addrd(Message::new(Type::Con, Code::EMPTY, Id(77), Token::default()),
                      addr));
    assert!(matches!(ep.poll_req(), Err(nb::Error::WouldBlock)));

    let sent = net.drain_tx();
    assert_eq!((sent[0].data().ty, sent[0].data().id), (Type::Reset, Id(77)));
  }

  #[test]
  fn unknown_critical_option_in_request_gets_4_02() {
    let (mut ep, net) = endpoint(deterministic_config());
    let addr = dummy_addr();

    let mut req = Message::new(Type::Con, Code::GET, Id(5), Token::from_bytes(&[1]));
    req.set(OptNumber(3001), OptValue(std_alloc::vec![1]));
    net.push_rx(Addrd(req, addr));

    assert!(matches!(ep.poll_req(), Err(nb::Error::WouldBlock)));

    let sent = net.drain_tx();
    assert_eq!(sent[0].data().code, code::BAD_OPTION);
    assert_eq!(sent[0].data().id, Id(5));
  }

  #[test]
  fn unknown_critical_option_in_response_rejects_it() {
    let (mut ep, net) = endpoint(deterministic_config());
    let (token, id) = send_get(&mut ep, &net);
    let addr = dummy_addr();

    let mut rep = Message::new(Type::Ack, Code::new(2, 5), id, token);
    rep.set(OptNumber(3001), OptValue(std_alloc::vec![1]));
    net.push_rx(Addrd(rep, addr));

    assert!(matches!(ep.poll_resp(token, addr),
                     Err(nb::Error::Other(Error::Failed(Failure::BadOption(OptNumber(3001)))))));
    assert_eq!(net.drain_tx()[0].data().ty, Type::Reset);
  }

  #[test]
  fn duplicate_separate_con_response_is_reacked_not_redelivered() {
    let (mut ep, net) = endpoint(deterministic_config());
    let (token, id) = send_get(&mut ep, &net);
    let addr = dummy_addr();

    net.push_rx(Addrd(Message::new(Type::Ack, Code::EMPTY, id, Token::default()),
                      addr));

    let mut rep = Message::new(Type::Con, Code::new(2, 5), Id(0x9000), token);
    rep.payload.0 = b"42".to_vec();
    net.push_rx(Addrd(rep.clone(), addr));

    assert!(nb::block!(ep.poll_resp(token, addr)).is_ok());
    net.drain_tx();

    // the server retransmits the response (our ACK was lost)
    net.push_rx(Addrd(rep, addr));
    assert!(matches!(ep.poll_resp(token, addr), Err(nb::Error::WouldBlock)));

    let sent = net.drain_tx();
    assert_eq!(sent.len(), 1);
    assert_eq!((sent[0].data().ty, sent[0].data().id), (Type::Ack, Id(0x9000)));
  }

  #[test]
  fn server_relation_sends_counted_notifications_one_con_in_transit() {
    let (mut ep, net) = endpoint(deterministic_config());
    let addr = dummy_addr();
    let token = Token::from_bytes(&[0xCC]);

    // a client registers
    let mut reg = Message::new(Type::Con, Code::GET, Id(1), token);
    reg.set_path("temp");
    reg.set_observe(Action::Register);
    net.push_rx(Addrd(reg, addr));

    let got = nb::block!(ep.poll_req()).unwrap();
    assert_eq!(got.data().msg().observe_action(), Some(Action::Register));
    net.drain_tx();

    // first notification: counted, confirmable by request
    let rep = {
      let mut r = Resp::con(got.data());
      r.set_payload(b"21.0".iter().copied());
      r
    };
    ep.notify(Addrd(token, addr), rep).unwrap();

    let sent = net.drain_tx();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data().ty, Type::Con);
    assert_eq!(sent[0].data().observe(), Some(1));
    let first_id = sent[0].data().id;

    // two fresher representations while the CON is unconfirmed:
    // both stash, the newer replacing the older, nothing hits the
    // wire
    for v in ["21.5", "22.0"] {
      let mut r = Resp::con(got.data());
      r.set_payload(v.bytes());
      ep.notify(Addrd(token, addr), r).unwrap();
    }
    assert!(net.drain_tx().is_empty());

    // the ACK frees the slot; only the newest follows, with a new ID
    net.push_rx(Addrd(Message::new(Type::Ack, Code::EMPTY, first_id, Token::default()),
                      addr));
    assert!(matches!(ep.poll_req(), Err(nb::Error::WouldBlock)));

    let sent = net.drain_tx();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data().payload.0, b"22.0".to_vec());
    assert_eq!(sent[0].data().observe(), Some(2));
    assert_ne!(sent[0].data().id, first_id);
  }

  #[test]
  fn cancelled_exchange_resolves_cancelled_and_stops_timers() {
    let (mut ep, net) = endpoint(deterministic_config());
    let (token, _) = send_get(&mut ep, &net);
    let addr = dummy_addr();

    ep.cancel(Addrd(token, addr));

    assert!(matches!(ep.poll_resp(token, addr),
                     Err(nb::Error::Other(Error::UnknownExchange))));

    // no retransmissions after cancellation
    ep.clock().set(60_000);
    let _ = ep.poll_req();
    assert!(net.drain_tx().is_empty());
  }

  #[test]
  fn stray_response_is_rejected_with_rst() {
    let (mut ep, net) = endpoint(deterministic_config());
    let addr = dummy_addr();

    let rep = Message::new(Type::Con, Code::new(2, 5), Id(0x0F0F), Token::from_bytes(&[9]));
    net.push_rx(Addrd(rep, addr));
    let _ = ep.poll_req();

    let sent = net.drain_tx();
    assert_eq!((sent[0].data().ty, sent[0].data().id),
               (Type::Reset, Id(0x0F0F)));
  }
}
