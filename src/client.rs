use crate::encoding::bincode;
use crate::errdata;
use crate::error::Result;
use crate::raft::{ConnectionType, Index, Member, Request, Response, ServerId};

use std::io::{BufReader, BufWriter, Write as _};
use std::net::{TcpStream, ToSocketAddrs};

/// A client for the Raft server's client RPC surface. Connections are
/// sequential request/response; a request that lands on a non-leader fails
/// with Error::NotLeader carrying a leader hint, and the caller reconnects
/// elsewhere.
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Client {
    /// Connects to a server.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let mut writer = BufWriter::new(stream.try_clone()?);
        bincode::serialize_into(&mut writer, &ConnectionType::Client)?;
        writer.flush()?;
        Ok(Self { reader: BufReader::new(stream), writer })
    }

    /// Issues a request and waits for its response.
    fn call(&mut self, request: Request) -> Result<Response> {
        bincode::serialize_into(&mut self.writer, &request)?;
        self.writer.flush()?;
        bincode::deserialize_from::<_, Result<Response>>(&mut self.reader)?
    }

    /// Appends an opaque payload to the replicated log, returning its index
    /// once committed.
    pub fn replicate(&mut self, payload: Vec<u8>) -> Result<Index> {
        match self.call(Request::Replicate(payload))? {
            Response::Replicate(index) => Ok(index),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Returns the server's id and addresses.
    pub fn get_server_info(&mut self) -> Result<(ServerId, String)> {
        match self.call(Request::GetServerInfo)? {
            Response::ServerInfo { id, addresses } => Ok((id, addresses)),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Returns the latest committed simple configuration and its id.
    pub fn get_configuration(&mut self) -> Result<(Index, Vec<Member>)> {
        match self.call(Request::GetConfiguration)? {
            Response::Configuration { id, members } => Ok((id, members)),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Replaces the cluster membership via joint consensus.
    pub fn set_configuration(&mut self, old_id: Index, members: Vec<Member>) -> Result<()> {
        match self.call(Request::SetConfiguration { old_id, members })? {
            Response::SetConfiguration => Ok(()),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Returns the commit index, if the server is confident of leadership.
    pub fn get_last_commit_index(&mut self) -> Result<Index> {
        match self.call(Request::GetLastCommitIndex)? {
            Response::LastCommitIndex(index) => Ok(index),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Verifies that the connection reached the intended server, detecting
    /// reconnections to a different peer.
    pub fn verify_recipient(&mut self, id: ServerId) -> Result<()> {
        match self.call(Request::VerifyRecipient { id: Some(id) })? {
            Response::VerifyRecipient { ok: true, .. } => Ok(()),
            Response::VerifyRecipient { error, .. } => {
                errdata!("{}", error.unwrap_or_else(|| "verification failed".to_string()))
            }
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// One-shot cluster initialization on an empty server.
    pub fn bootstrap(&mut self) -> Result<()> {
        match self.call(Request::Bootstrap)? {
            Response::Bootstrap => Ok(()),
            response => errdata!("unexpected response {response:?}"),
        }
    }
}
