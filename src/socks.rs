/// SOCKS5 CONNECT tunnelling for the upstream dial path
///
/// Speaks just enough of RFC 1928/1929 to open one outbound TCP tunnel:
/// greeting, optional username/password sub-negotiation, then a CONNECT
/// request with domain addressing so the proxy endpoint resolves the pool
/// hostname itself.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_USERPASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_IPV6: u8 = 0x04;

/// Negotiate a CONNECT tunnel to `host:port` over an established stream to
/// the SOCKS5 endpoint. On success the stream carries the tunnelled
/// connection.
pub async fn connect<S>(stream: &mut S, host: &str, port: u16, username: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if host.len() > 255 {
        bail!("hostname too long for SOCKS5 domain addressing");
    }

    // Greeting: offer user/pass only when credentials are configured.
    let methods: &[u8] = if username.is_empty() {
        &[AUTH_NONE]
    } else {
        &[AUTH_NONE, AUTH_USERPASS]
    };
    let mut greeting = vec![VERSION, methods.len() as u8];
    greeting.extend_from_slice(methods);
    stream.write_all(&greeting).await.context("socks5 greeting")?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.context("socks5 method select")?;
    if choice[0] != VERSION {
        bail!("socks5 endpoint answered with version {:#04x}", choice[0]);
    }
    match choice[1] {
        AUTH_NONE => {}
        AUTH_USERPASS => authenticate(stream, username, password).await?,
        AUTH_NO_ACCEPTABLE => bail!("socks5 endpoint accepts none of the offered auth methods"),
        other => bail!("socks5 endpoint chose unsupported auth method {:#04x}", other),
    }

    // CONNECT with the pool hostname as a domain address.
    let mut request = vec![VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.context("socks5 connect request")?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.context("socks5 connect reply")?;
    if head[1] != 0x00 {
        bail!("socks5 connect refused: {}", reply_message(head[1]));
    }

    // Drain the bound address so the tunnel payload starts clean.
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => bail!("socks5 reply with unknown address type {:#04x}", other),
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await.context("socks5 bound address")?;

    Ok(())
}

async fn authenticate<S>(stream: &mut S, username: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if username.len() > 255 || password.len() > 255 {
        bail!("socks5 credentials exceed 255 bytes");
    }
    let mut msg = vec![0x01, username.len() as u8];
    msg.extend_from_slice(username.as_bytes());
    msg.push(password.len() as u8);
    msg.extend_from_slice(password.as_bytes());
    stream.write_all(&msg).await.context("socks5 auth request")?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await.context("socks5 auth reply")?;
    if status[1] != 0x00 {
        bail!("socks5 authentication rejected");
    }
    Ok(())
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}
