//! Browser-side HMR runtime.
//!
//! Served at `/@client`. Every transformed JS module gets a preamble that
//! imports `createHotContext` from here and installs `import.meta.hot`.

use crate::paths::CLIENT_PATH;

/// Preamble injected at the top of each served JS module.
#[must_use]
pub fn hot_preamble(module_url: &str) -> String {
    format!(
        "import {{ createHotContext as __baily_create_hot_context }} from \"{CLIENT_PATH}\";\nimport.meta.hot = __baily_create_hot_context({module_url:?});\n"
    )
}

/// The client runtime with host/port/base substituted.
#[must_use]
pub fn client_runtime(host: &str, port: u16, base: &str) -> String {
    CLIENT_RUNTIME
        .replace("__HMR_HOST__", host)
        .replace("__HMR_PORT__", &port.to_string())
        .replace("__BASE__", base)
}

/// The HMR client runtime JavaScript.
///
/// Maintains per-module registrations (`accept`, `acceptExports`,
/// `dispose`, `prune`, custom listeners), applies `update` batches in
/// arrival order, swaps `<link>` stylesheets without a flash of unstyled
/// content, renders the error overlay, and polls for a reconnect after
/// the server goes away.
const CLIENT_RUNTIME: &str = r#"
// baily client runtime
const base = '__BASE__';
const socketHost = '__HMR_HOST__:__HMR_PORT__';

const hotModulesMap = new Map();      // ownerPath -> { callbacks: [{ deps, fn }] }
const disposeMap = new Map();         // ownerPath -> dispose cb
const pruneMap = new Map();           // ownerPath -> prune cb
const dataMap = new Map();            // ownerPath -> persisted data
const customListenersMap = new Map(); // event -> [cb]
const declinedModules = new Set();

let socket;
let wasConnected = false;

function connect(target, onFail) {
  let ws;
  try {
    ws = new WebSocket(target, 'vite-hmr');
  } catch (e) {
    onFail(e);
    return;
  }

  let opened = false;
  ws.addEventListener('open', () => {
    opened = true;
    wasConnected = true;
    socket = ws;
    console.debug('[baily] connected.');
  });

  ws.addEventListener('message', ({ data }) => {
    handleMessage(JSON.parse(data));
  });

  ws.addEventListener('close', () => {
    // Never opened: the primary path may be behind a proxy that drops
    // upgrades. Fall back to a direct host:port target once.
    if (!opened && onFail) {
      onFail();
      return;
    }
    if (wasConnected) {
      console.log('[baily] server connection lost. Polling for restart...');
      waitForRestart();
    }
  });
}

connect(`ws://${location.host}${base}`, () => {
  connect(`ws://${socketHost}${base}`, () => {
    console.error('[baily] failed to connect to the dev server.');
  });
});

async function waitForRestart() {
  // eslint-disable-next-line no-constant-condition
  while (true) {
    try {
      await fetch(`${base}__ping`, { mode: 'no-cors' });
      break;
    } catch {
      await new Promise((r) => setTimeout(r, 1000));
    }
  }
  location.reload();
}

setInterval(() => {
  if (socket && socket.readyState === WebSocket.OPEN) {
    socket.send(JSON.stringify({ type: 'ping' }));
  }
}, 10000);

// Batches apply strictly in arrival order: each batch queues behind the
// previous one on this promise chain.
let updateQueue = Promise.resolve();

function handleMessage(payload) {
  switch (payload.type) {
    case 'connected':
      console.debug('[baily] ready.');
      break;

    case 'update':
      clearErrorOverlay();
      updateQueue = updateQueue.then(async () => {
        for (const update of payload.updates) {
          if (update.type === 'js-update') {
            await applyJsUpdate(update);
          } else {
            applyCssUpdate(update);
          }
        }
      });
      break;

    case 'full-reload':
      if (payload.path && payload.path.endsWith('.html')) {
        // Only reload pages actually rendered from that file.
        const current = location.pathname;
        const normalized = current.endsWith('/') ? current + 'index.html' : current;
        if (normalized !== payload.path && current !== payload.path) {
          break;
        }
      }
      location.reload();
      break;

    case 'prune':
      for (const path of payload.paths) {
        const dispose = pruneMap.get(path);
        if (dispose) dispose(dataMap.get(path));
        hotModulesMap.delete(path);
        disposeMap.delete(path);
        pruneMap.delete(path);
      }
      break;

    case 'error':
      showErrorOverlay(payload.err);
      break;

    case 'custom': {
      const listeners = customListenersMap.get(payload.event) || [];
      listeners.forEach((cb) => cb(payload.data));
      break;
    }

    case 'ping':
      // Keep-alive echo from the server; nothing to do.
      break;
  }
}

async function applyJsUpdate({ path, acceptedPath, timestamp }) {
  const mod = hotModulesMap.get(path);
  if (!mod || declinedModules.has(acceptedPath)) {
    // The boundary never registered (or declined): the graph on the
    // server was ahead of the client. Recover with a reload.
    location.reload();
    return;
  }

  const disposer = disposeMap.get(acceptedPath);
  if (disposer) await disposer(dataMap.get(acceptedPath));

  try {
    const newModule = await import(
      acceptedPath + (acceptedPath.includes('?') ? '&' : '?') + 't=' + timestamp
    );
    for (const { deps, fn } of mod.callbacks) {
      if (deps.includes(acceptedPath)) {
        fn(deps.map((dep) => (dep === acceptedPath ? newModule : undefined)));
      }
    }
    console.debug(`[baily] hot updated: ${acceptedPath}`);
  } catch (err) {
    console.error(`[baily] failed to apply update for ${acceptedPath}:`, err);
    location.reload();
  }
}

function applyCssUpdate({ path, timestamp }) {
  const links = document.querySelectorAll('link[rel="stylesheet"]');
  for (const link of links) {
    const url = new URL(link.href, location.origin);
    if (url.pathname !== path) continue;

    // Clone with a fresh timestamp, drop the old element only once the
    // clone has loaded so styles never flash away.
    const next = link.cloneNode();
    url.searchParams.set('t', timestamp);
    next.href = url.pathname + '?' + url.searchParams.toString();
    next.addEventListener('load', () => link.remove());
    next.addEventListener('error', () => link.remove());
    link.after(next);
    console.debug(`[baily] css hot updated: ${path}`);
    return;
  }
}

const OVERLAY_ID = 'baily-error-overlay';

function showErrorOverlay(err) {
  clearErrorOverlay();
  const overlay = document.createElement('div');
  overlay.id = OVERLAY_ID;
  overlay.style.cssText =
    'position:fixed;inset:0;background:rgba(0,0,0,0.9);color:#ff5555;' +
    'padding:32px;font-family:monospace;font-size:14px;white-space:pre-wrap;' +
    'overflow:auto;z-index:99999;cursor:pointer;';
  const parts = [err.message || String(err)];
  if (err.frame) parts.push('', err.frame);
  if (err.stack) parts.push('', err.stack);
  if (err.file) parts.push('', 'in ' + err.file);
  overlay.textContent = parts.join('\n') + '\n\n(click to dismiss)';
  overlay.addEventListener('click', () => overlay.remove());
  document.body.appendChild(overlay);
}

function clearErrorOverlay() {
  const existing = document.getElementById(OVERLAY_ID);
  if (existing) existing.remove();
}

export function createHotContext(ownerPath) {
  if (!dataMap.has(ownerPath)) {
    dataMap.set(ownerPath, {});
  }

  // A re-created context (after an HMR re-fetch) starts clean.
  const mod = hotModulesMap.get(ownerPath);
  if (mod) mod.callbacks = [];
  declinedModules.delete(ownerPath);

  function acceptDeps(deps, fn = () => {}) {
    const entry = hotModulesMap.get(ownerPath) || { callbacks: [] };
    entry.callbacks.push({ deps, fn });
    hotModulesMap.set(ownerPath, entry);
  }

  return {
    get data() {
      return dataMap.get(ownerPath);
    },

    accept(deps, cb) {
      if (typeof deps === 'function' || !deps) {
        // Self-accept: the module handles its own replacement.
        acceptDeps([ownerPath], (mods) => deps && deps(mods[0]));
      } else if (typeof deps === 'string') {
        acceptDeps([deps], (mods) => cb && cb(mods[0]));
      } else if (Array.isArray(deps)) {
        acceptDeps(deps, cb);
      } else {
        throw new Error('invalid hot.accept() usage.');
      }
    },

    acceptExports(_names, cb) {
      acceptDeps([ownerPath], (mods) => cb && cb(mods[0]));
    },

    dispose(cb) {
      disposeMap.set(ownerPath, cb);
    },

    prune(cb) {
      pruneMap.set(ownerPath, cb);
    },

    decline() {
      declinedModules.add(ownerPath);
    },

    invalidate() {
      // Reference behavior: give up on in-place replacement.
      location.reload();
    },

    on(event, cb) {
      const existing = customListenersMap.get(event) || [];
      existing.push(cb);
      customListenersMap.set(event, existing);
    },

    send(event, data) {
      if (socket && socket.readyState === WebSocket.OPEN) {
        socket.send(JSON.stringify({ type: 'custom', event, data }));
      }
    },
  };
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_substitutes_tokens() {
        let runtime = client_runtime("localhost", 3000, "/");
        assert!(runtime.contains("localhost:3000"));
        assert!(!runtime.contains("__HMR_PORT__"));
        assert!(!runtime.contains("__BASE__"));
    }

    #[test]
    fn test_runtime_exposes_hot_api() {
        let runtime = client_runtime("localhost", 3000, "/");
        for needle in [
            "export function createHotContext",
            "acceptExports",
            "dispose(",
            "prune(",
            "decline()",
            "invalidate()",
            "'vite-hmr'",
        ] {
            assert!(runtime.contains(needle), "runtime should contain {needle}");
        }
    }

    #[test]
    fn test_preamble_imports_client() {
        let preamble = hot_preamble("/src/app.js");
        assert!(preamble.contains("from \"/@client\""));
        assert!(preamble.contains("__baily_create_hot_context(\"/src/app.js\")"));
        assert!(preamble.contains("import.meta.hot ="));
    }
}
