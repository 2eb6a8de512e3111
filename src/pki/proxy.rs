//! Outbound proxy selection.

use tracing::{debug, info};

use crate::pki::crl::{ProxyMap, validate_url};
use crate::pki::errors::{PkiError, PkiResult};
use crate::pki::models::{NewProxyConfig, ProxyConfig, ProxyId, RevocationList};
use crate::pki::store::{PkiStore, StoreError, StoreTx};

pub fn add_proxy<S: PkiStore>(store: &S, new: NewProxyConfig) -> PkiResult<ProxyConfig> {
    validate_url(&new.url)?;
    let proxy = store.transaction(|tx| tx.insert_proxy(new).map_err(PkiError::from))?;
    info!("Added proxy {}", proxy.name);
    Ok(proxy)
}

/// Make `id` the default proxy. The previous default, if any, loses the
/// flag in the same transaction.
pub fn set_default<S: PkiStore>(store: &S, id: ProxyId) -> PkiResult<ProxyConfig> {
    store.transaction(|tx| {
        let mut proxy = tx
            .proxy(id)?
            .ok_or(StoreError::NotFound { entity: "proxy", id })?;

        for mut other in tx.proxies()? {
            if other.id != id && other.is_default {
                debug!("Proxy {} is no longer the default", other.name);
                other.is_default = false;
                tx.update_proxy(&other)?;
            }
        }

        proxy.is_default = true;
        tx.update_proxy(&proxy)?;
        info!("Proxy {} is now the default", proxy.name);
        Ok(proxy)
    })
}

pub fn default_proxy(tx: &dyn StoreTx) -> PkiResult<Option<ProxyConfig>> {
    Ok(tx.proxies()?.into_iter().find(|p| p.is_default))
}

/// The proxy a CRL is fetched through: none when `no_proxy` is set,
/// otherwise its own proxy if that is active.
pub fn effective_proxy(tx: &dyn StoreTx, crl: &RevocationList) -> PkiResult<Option<ProxyConfig>> {
    if crl.no_proxy {
        return Ok(None);
    }
    let Some(id) = crl.proxy_id else {
        return Ok(None);
    };
    match tx.proxy(id)? {
        Some(proxy) if proxy.is_active => Ok(Some(proxy)),
        Some(proxy) => {
            debug!("Proxy {} is inactive, connecting directly", proxy.name);
            Ok(None)
        }
        None => Ok(None),
    }
}

pub fn proxy_map(proxy: Option<&ProxyConfig>) -> PkiResult<Option<ProxyMap>> {
    proxy.map(ProxyConfig::scheme_map).transpose()
}
