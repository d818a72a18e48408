//! Service registration and control dispatch

use crate::config::ServerConfig;
use crate::handler::{Context, Dispatch, Exchange, Handler, SessionData, SlotPool};
use core_types::{CapKind, CapRange, CapSel, Code, EpId, Ownership, Result, INVALID_SEL};
use gates::{Env, GateIStream, ObjCap, RecvBuf, RecvGate, SendGate};
use ipc::{IStream, OStream};
use kernel_api::syscalls::reply_stream;
use kernel_api::{ServiceRequest, CTRL_LABEL, SEL_VPE};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

struct Entry<S> {
    data: SessionData,
    sess: S,
}

struct ServerState<H: Handler> {
    env: Env,
    name: String,
    handler: H,
    bufs: Vec<Rc<RecvBuf>>,
    pool: SlotPool,
    sessions: BTreeMap<u64, Entry<H::Session>>,
    next_ident: u64,
    dispatch: Dispatch,
    shut_down: bool,
}

impl<H: Handler> ServerState<H> {
    fn open(&mut self, args: Vec<Value>) -> Result<u64> {
        let ident = self.next_ident;
        let mut data = SessionData::default();
        let res = {
            let mut ctx = Context {
                env: &self.env,
                ident,
                bufs: &self.bufs,
                pool: &mut self.pool,
                data: &mut data,
                dispatch: &self.dispatch,
            };
            self.handler
                .open(&mut ctx, &mut IStream::from_values(args))
        };
        match res {
            Ok(sess) => {
                self.next_ident += 1;
                self.sessions.insert(ident, Entry { data, sess });
                log::debug!(target: "serv", "'{}': opened session {}", self.name, ident);
                Ok(ident)
            }
            Err(code) => {
                data.release(&mut self.pool);
                Err(code)
            }
        }
    }

    fn exchange(
        &mut self,
        ident: u64,
        count: u32,
        args: Vec<Value>,
        obtain: bool,
    ) -> Result<Exchange> {
        let entry = self.sessions.get_mut(&ident).ok_or(Code::InvArgs)?;
        let before = entry.data.gate_count();
        let mut ctx = Context {
            env: &self.env,
            ident,
            bufs: &self.bufs,
            pool: &mut self.pool,
            data: &mut entry.data,
            dispatch: &self.dispatch,
        };
        let mut args = IStream::from_values(args);
        let res = if obtain {
            self.handler
                .obtain(&mut ctx, &mut entry.sess, count, &mut args)
        } else {
            self.handler
                .delegate(&mut ctx, &mut entry.sess, count, &mut args)
        };
        let res = res.and_then(|ex| {
            if ex.caps.count == count {
                Ok(ex)
            } else {
                Err(Code::InvArgs)
            }
        });
        if res.is_err() {
            entry.data.rollback(before, &mut self.pool);
        }
        res
    }

    fn close(&mut self, ident: u64) -> Result<()> {
        let entry = self.sessions.remove(&ident).ok_or(Code::InvArgs)?;
        self.handler.close(ident, entry.sess);
        entry.data.release(&mut self.pool);
        log::debug!(target: "serv", "'{}': closed session {}", self.name, ident);
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.handler.shutdown();
        for buf in &self.bufs {
            if let Err(code) = buf.disable() {
                log::warn!(target: "serv", "'{}': cannot disable ep {}: {}", self.name, buf.ep(), code);
            }
        }
        log::debug!(target: "serv", "'{}': shut down", self.name);
    }

    /// Runs one control request; returns the reply and whether to shut down
    fn control(&mut self, req: ServiceRequest) -> (OStream, bool) {
        log::trace!(target: "serv", "'{}': {:?}", self.name, req.cmd());
        match req {
            ServiceRequest::Open { args } => {
                let res = self.open(args);
                let os = reply_stream(&res);
                let os = match res {
                    Ok(ident) => os.push(&ident),
                    Err(_) => os,
                };
                (os, false)
            }
            ServiceRequest::Obtain { ident, count, args } => {
                (exchange_reply(self.exchange(ident, count, args, true)), false)
            }
            ServiceRequest::Delegate { ident, count, args } => {
                (exchange_reply(self.exchange(ident, count, args, false)), false)
            }
            ServiceRequest::Close { ident } => (reply_stream(&self.close(ident)), false),
            ServiceRequest::Shutdown => (reply_stream::<()>(&Ok(())), true),
        }
    }
}

fn exchange_reply(res: Result<Exchange>) -> OStream {
    let os = reply_stream(&res);
    match res {
        Ok(ex) => os.push(&ex.caps).push_stream(ex.args),
        Err(_) => os,
    }
}

fn send_reply(msg: &mut GateIStream, os: OStream) {
    if let Err(code) = msg.reply_msg(os) {
        log::debug!(target: "serv", "reply on ep {} not delivered: {}", msg.ep(), code);
    }
}

fn handle_ctrl<H: Handler + 'static>(
    weak: &Weak<RefCell<ServerState<H>>>,
    msg: &mut GateIStream,
) -> Result<()> {
    let Some(state) = weak.upgrade() else {
        return Ok(());
    };
    let Ok(mut st) = state.try_borrow_mut() else {
        log::warn!(target: "serv", "control request while busy, dropped");
        return Ok(());
    };
    let req = match ServiceRequest::decode(msg.stream()) {
        Ok(req) => req,
        Err(code) => {
            log::warn!(target: "serv", "'{}': malformed control request", st.name);
            send_reply(msg, reply_stream::<()>(&Err(code)));
            return Ok(());
        }
    };
    let (reply, shutdown) = st.control(req);
    send_reply(msg, reply);
    if shutdown {
        st.shutdown();
    }
    Ok(())
}

fn handle_message<H: Handler + 'static>(
    weak: &Weak<RefCell<ServerState<H>>>,
    ident: u64,
    msg: &mut GateIStream,
) -> Result<()> {
    let Some(state) = weak.upgrade() else {
        return Ok(());
    };
    let Ok(mut st) = state.try_borrow_mut() else {
        log::warn!(target: "serv", "request for session {} while busy, dropped", ident);
        return Ok(());
    };
    let st = &mut *st;
    let Some(entry) = st.sessions.get_mut(&ident).filter(|e| e.data.is_bound()) else {
        log::debug!(target: "serv", "'{}': request for unbound session {}", st.name, ident);
        send_reply(msg, reply_stream::<()>(&Err(Code::InvArgs)));
        return Ok(());
    };
    let mut ctx = Context {
        env: &st.env,
        ident,
        bufs: &st.bufs,
        pool: &mut st.pool,
        data: &mut entry.data,
        dispatch: &st.dispatch,
    };
    let res = st.handler.message(&mut ctx, &mut entry.sess, msg);
    if msg.is_done() {
        return Ok(());
    }
    // the client's credit only comes back with a reply
    match res {
        Ok(()) => {
            log::warn!(target: "serv", "'{}': session {} request left unanswered", st.name, ident);
            send_reply(msg, reply_stream::<()>(&Ok(())));
        }
        Err(code) => {
            log::debug!(target: "serv", "'{}': session {} request failed: {}", st.name, ident, code);
            send_reply(msg, reply_stream::<()>(&Err(code)));
        }
    }
    Ok(())
}

/// A registered service
///
/// Construction creates the receive buffers, a control gate on each and
/// registers the name with the kernel. The service then runs on the VPE's
/// work loop until the kernel sends `Shutdown`. Dropping the server
/// revokes the service, which also revokes every client session.
pub struct Server<H: Handler + 'static> {
    env: Env,
    name: String,
    srv: ObjCap,
    ctrl_sgate: SendGate,
    ctrl_rgates: Vec<RecvGate>,
    state: Rc<RefCell<ServerState<H>>>,
}

impl<H: Handler + 'static> Server<H> {
    /// Registers `name` with the default buffer configuration
    pub fn new(env: &Env, name: &str, handler: H) -> Result<Self> {
        Self::with_config(env, name, handler, ServerConfig::default())
    }

    pub fn with_config(env: &Env, name: &str, handler: H, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let bufs = (0..config.recv_bufs)
            .map(|_| RecvBuf::create(env, config.buf_order, config.msg_order))
            .collect::<Result<Vec<_>>>()?;
        let slots = config.recv_config().slots();

        let state = Rc::new_cyclic(|weak: &Weak<RefCell<ServerState<H>>>| {
            let weak = weak.clone();
            let dispatch: Dispatch = Rc::new(move |ident: u64, msg: &mut GateIStream| {
                handle_message(&weak, ident, msg)
            });
            RefCell::new(ServerState {
                env: env.clone(),
                name: name.to_string(),
                handler,
                pool: SlotPool::new(bufs.len(), slots),
                bufs,
                sessions: BTreeMap::new(),
                next_ident: 1,
                dispatch,
                shut_down: false,
            })
        });

        let ctrl_rgates: Vec<RecvGate> = state
            .borrow()
            .bufs
            .iter()
            .map(|buf| {
                let rgate = RecvGate::create(buf, CTRL_LABEL);
                let weak = Rc::downgrade(&state);
                rgate.subscribe(move |msg| handle_ctrl(&weak, msg));
                rgate
            })
            .collect();
        let first = ctrl_rgates.first().ok_or(Code::InvArgs)?;
        let ctrl_sgate = SendGate::create(first, 1)?;

        let srv_sel = env.alloc_sel();
        if let Err(code) = env.syscalls().create_srv(ctrl_sgate.sel(), srv_sel, name) {
            env.free_sel(srv_sel);
            return Err(code);
        }
        log::debug!(target: "serv", "{}: registered service '{}'", env.vpe_id(), name);

        Ok(Self {
            env: env.clone(),
            name: name.to_string(),
            srv: ObjCap::new(env, CapKind::Service, srv_sel, Ownership::Owned),
            ctrl_sgate,
            ctrl_rgates,
            state,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Selector of the service capability
    pub fn sel(&self) -> CapSel {
        self.srv.sel()
    }

    /// Selector of the gate the kernel sends control requests over
    pub fn ctrl_sel(&self) -> CapSel {
        self.ctrl_sgate.sel()
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Endpoints of the receive buffers; the first one takes control
    /// requests
    pub fn buf_eps(&self) -> Vec<EpId> {
        self.state.borrow().bufs.iter().map(|b| b.ep()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.state.borrow().sessions.len()
    }

    /// Message slots not yet promised to any session gate
    pub fn free_slots(&self) -> usize {
        self.state.borrow().pool.total_free()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.borrow().shut_down
    }

    /// Runs `f` on the handler
    pub fn with_handler<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        f(&mut self.state.borrow_mut().handler)
    }

    /// Runs `f` on every open session, in ident order
    pub fn for_each_session(&self, mut f: impl FnMut(u64, &mut H::Session)) {
        let mut st = self.state.borrow_mut();
        for (ident, entry) in st.sessions.iter_mut() {
            f(*ident, &mut entry.sess);
        }
    }

    /// Creates a session with this service for the server's own use
    pub fn own_session(&self, args: OStream) -> Result<(u64, CapSel)> {
        let ident = self.state.borrow_mut().open(args.into_values()?)?;
        let sel = self.env.alloc_sel();
        if let Err(code) = self.env.syscalls().create_sess_at(self.sel(), sel, ident) {
            self.env.free_sel(sel);
            if let Err(close) = self.state.borrow_mut().close(ident) {
                log::debug!(target: "serv", "'{}': session {} not closed: {}", self.name, ident, close);
            }
            return Err(code);
        }
        Ok((ident, sel))
    }

    /// Stops serving without waiting for the kernel
    pub fn shutdown(&self) {
        self.state.borrow_mut().shutdown();
    }

    /// Runs the VPE's work loop until the service is shut down
    pub fn run(&self) -> Result<()> {
        self.env.run()
    }
}

impl<H: Handler + 'static> Drop for Server<H> {
    fn drop(&mut self) {
        let sel = self.srv.sel();
        if sel == INVALID_SEL {
            return;
        }
        // the kernel refuses while control requests sit in our buffers
        loop {
            match self
                .env
                .syscalls()
                .revoke(SEL_VPE, CapRange::single(sel), true)
            {
                Err(Code::MsgsWaiting) => match self.env.workloop().tick(&self.env) {
                    Ok(true) => {}
                    Ok(false) => self.env.dtu().wait(),
                    Err(code) => {
                        log::warn!(target: "serv", "'{}': pending requests failed: {}", self.name, code);
                        break;
                    }
                },
                Err(code) => {
                    log::warn!(target: "serv", "'{}': service not revoked: {}", self.name, code);
                    break;
                }
                Ok(()) => {
                    self.env.free_sel(sel);
                    log::debug!(target: "serv", "'{}': service revoked", self.name);
                    break;
                }
            }
        }
        self.srv.set_ownership(Ownership::Borrowed);
    }
}
